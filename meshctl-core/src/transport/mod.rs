// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! C3 — Transport Channels. See `codec` for the wire frame and `channel`
//! for the per-connection demultiplexer.

pub mod channel;
pub mod codec;

pub use channel::{dial, TransportChannel};
pub use codec::{channel_ids, Frame, FrameCodec, TransportError, MAX_FRAME_SIZE};
