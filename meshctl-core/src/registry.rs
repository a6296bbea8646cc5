// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! C1 — Service Registry.
//!
//! A `Registry<S>` is a name -> implementation map for one pluggable
//! contract `S` (a trait object, e.g. `dyn ServiceRunner`), with a
//! designated "default" entry. Every other component locates its
//! collaborators through a `Registry<S>` rather than holding a concrete
//! type directly, so alternative implementations can be swapped in without
//! touching the component that uses them.
//!
//! The teacher's dependency-injected interface plus "default registration"
//! token has no equivalent to a JVM dynamic proxy in Rust. Per the
//! REDESIGN FLAGS in spec §9 option (c), callers never cache a trait object
//! obtained from the default; they go through the handle returned by
//! [`Registry::default_registration`] on every call, which re-resolves the
//! live default underneath.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no default registration is present")]
    NoDefault,
    #[error("the default registration changed from singleton-style to constructor-style; the proxy obtained before the swap is no longer valid")]
    RegistryAbsent,
}

type Constructor<S> = Arc<dyn Fn() -> Arc<S> + Send + Sync>;

enum Kind<S: ?Sized> {
    Singleton(Arc<S>),
    Constructor(Constructor<S>),
}

impl<S: ?Sized> Clone for Kind<S> {
    fn clone(&self) -> Self {
        match self {
            Kind::Singleton(s) => Kind::Singleton(s.clone()),
            Kind::Constructor(c) => Kind::Constructor(c.clone()),
        }
    }
}

/// One named binding of a service type `S` to an implementation.
pub struct Registration<S: ?Sized> {
    name: String,
    owner: Option<String>,
    kind: Kind<S>,
}

impl<S: ?Sized + Send + Sync + 'static> Registration<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn is_constructor_style(&self) -> bool {
        matches!(self.kind, Kind::Constructor(_))
    }

    /// Returns the instance for this registration: the same `Arc` every time
    /// for a singleton-style registration, or a freshly constructed value
    /// every time for a constructor-style one.
    pub fn instance(&self) -> Arc<S> {
        match &self.kind {
            Kind::Singleton(s) => s.clone(),
            Kind::Constructor(ctor) => ctor(),
        }
    }
}

struct Inner<S: ?Sized> {
    by_name: HashMap<String, Arc<Registration<S>>>,
    order: Vec<String>,
    default: Option<String>,
}

impl<S: ?Sized> Default for Inner<S> {
    fn default() -> Self {
        Self {
            by_name: HashMap::new(),
            order: Vec::new(),
            default: None,
        }
    }
}

/// A readers-writer-locked binding for one service type `S`. Reads
/// (lookups) run concurrently; registration/unregistration is exclusive.
/// No lock is held while caller-supplied code (a constructor closure) runs:
/// the lock is acquired only to make the registration decision, then
/// dropped before any user code executes.
pub struct Registry<S: ?Sized> {
    inner: Arc<RwLock<Inner<S>>>,
}

impl<S: ?Sized> Clone for Registry<S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<S: ?Sized> Default for Registry<S> {
    fn default() -> Self {
        Self { inner: Arc::new(RwLock::new(Inner::default())) }
    }
}

impl<S: ?Sized + Send + Sync + 'static> Registry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent by name: re-registering the same name returns the
    /// existing registration rather than creating a second one. The first
    /// registration of a service type becomes its default.
    pub fn register(&self, name: impl Into<String>, instance: Arc<S>) -> Arc<Registration<S>> {
        self.register_with_owner(name, Kind::Singleton(instance), None)
    }

    pub fn register_constructor<F>(&self, name: impl Into<String>, ctor: F) -> Arc<Registration<S>>
    where
        F: Fn() -> Arc<S> + Send + Sync + 'static,
    {
        self.register_with_owner(name, Kind::Constructor(Arc::new(ctor)), None)
    }

    pub fn register_owned(&self, name: impl Into<String>, instance: Arc<S>, owner: impl Into<String>) -> Arc<Registration<S>> {
        self.register_with_owner(name, Kind::Singleton(instance), Some(owner.into()))
    }

    fn register_with_owner(&self, name: impl Into<String>, kind: Kind<S>, owner: Option<String>) -> Arc<Registration<S>> {
        let name = name.into();
        let mut guard = self.inner.write().expect("registry lock poisoned");
        if let Some(existing) = guard.by_name.get(&name) {
            return existing.clone();
        }
        let reg = Arc::new(Registration { name: name.clone(), owner, kind });
        guard.by_name.insert(name.clone(), reg.clone());
        guard.order.push(name.clone());
        if guard.default.is_none() {
            guard.default = Some(name);
        }
        reg
    }

    pub fn registration(&self, name: &str) -> Option<Arc<Registration<S>>> {
        self.inner.read().expect("registry lock poisoned").by_name.get(name).cloned()
    }

    pub fn registrations(&self) -> Vec<Arc<Registration<S>>> {
        let guard = self.inner.read().expect("registry lock poisoned");
        guard.order.iter().filter_map(|n| guard.by_name.get(n)).cloned().collect()
    }

    pub fn default_name(&self) -> Option<String> {
        self.inner.read().expect("registry lock poisoned").default.clone()
    }

    /// Marks `name` as the default. No-op if `name` is not registered.
    pub fn mark_as_default(&self, name: &str) {
        let mut guard = self.inner.write().expect("registry lock poisoned");
        if guard.by_name.contains_key(name) {
            guard.default = Some(name.to_string());
        }
    }

    pub fn unregister(&self, name: &str) {
        let mut guard = self.inner.write().expect("registry lock poisoned");
        guard.by_name.remove(name);
        guard.order.retain(|n| n != name);
        if guard.default.as_deref() == Some(name) {
            guard.default = guard.order.first().cloned();
        }
    }

    /// Removes exactly the registrations whose `owner` tag equals `owner`
    /// (the "loader/module" a plug-in was discovered from).
    pub fn unregister_all_by_owner(&self, owner: &str) {
        let mut guard = self.inner.write().expect("registry lock poisoned");
        let doomed: Vec<String> = guard
            .by_name
            .iter()
            .filter(|(_, reg)| reg.owner.as_deref() == Some(owner))
            .map(|(n, _)| n.clone())
            .collect();
        for name in &doomed {
            guard.by_name.remove(name);
        }
        guard.order.retain(|n| !doomed.contains(n));
        if guard.default.as_ref().map(|d| doomed.contains(d)).unwrap_or(false) {
            guard.default = guard.order.first().cloned();
        }
    }

    /// Returns a stable façade over whatever is currently the default.
    /// Every call through the façade re-resolves the live default.
    pub fn default_registration(&self) -> DefaultFacade<S> {
        DefaultFacade { registry: self.clone() }
    }
}

/// Façade returned by [`Registry::default_registration`]. See the module
/// doc comment for why this replaces a dynamic proxy.
pub struct DefaultFacade<S: ?Sized> {
    registry: Registry<S>,
}

impl<S: ?Sized> Clone for DefaultFacade<S> {
    fn clone(&self) -> Self {
        Self { registry: self.registry.clone() }
    }
}

/// The result of calling `instance()` on a default façade.
pub enum DefaultInstance<S: ?Sized + Send + Sync + 'static> {
    /// The default was singleton-style: a live proxy that re-checks the
    /// default on every invocation via [`DefaultProxy::call`].
    Proxy(DefaultProxy<S>),
    /// The default was constructor-style: one freshly built instance,
    /// vended once and never re-checked.
    Owned(Arc<S>),
}

impl<S: ?Sized + Send + Sync + 'static> DefaultFacade<S> {
    pub fn instance(&self) -> Result<DefaultInstance<S>, RegistryError> {
        let guard = self.registry.inner.read().expect("registry lock poisoned");
        let name = guard.default.clone().ok_or(RegistryError::NoDefault)?;
        let reg = guard.by_name.get(&name).cloned().ok_or(RegistryError::NoDefault)?;
        drop(guard);
        match &reg.kind {
            Kind::Singleton(_) => Ok(DefaultInstance::Proxy(DefaultProxy { registry: self.registry.clone() })),
            Kind::Constructor(ctor) => Ok(DefaultInstance::Owned(ctor())),
        }
    }
}

/// A transparent proxy over the *current* default, valid only while that
/// default remains singleton-style. See module docs and spec §9.
pub struct DefaultProxy<S: ?Sized> {
    registry: Registry<S>,
}

impl<S: ?Sized + Send + Sync + 'static> DefaultProxy<S> {
    /// Invokes `f` against whatever instance is currently the default.
    /// Fails with [`RegistryError::RegistryAbsent`] if the default has since
    /// been swapped to a constructor-style registration (or removed).
    pub fn call<R>(&self, f: impl FnOnce(&S) -> R) -> Result<R, RegistryError> {
        let guard = self.registry.inner.read().expect("registry lock poisoned");
        let name = guard.default.clone().ok_or(RegistryError::RegistryAbsent)?;
        let reg = guard.by_name.get(&name).cloned().ok_or(RegistryError::RegistryAbsent)?;
        drop(guard);
        match &reg.kind {
            Kind::Singleton(s) => Ok(f(s)),
            Kind::Constructor(_) => Err(RegistryError::RegistryAbsent),
        }
    }
}
