// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 quorumdb contributors

//! Wire protocol: headers, message envelopes, and buffer pooling.
//!
//! Every message is `Header || body`. Validity requires a matching cluster
//! id, a valid header checksum, a valid body checksum, a size within
//! bounds, and a known command tag; anything else is dropped at the edge
//! before it reaches replica state.

pub mod header;
pub mod message;
pub mod pool;

pub use header::{Command, Header, Operation, REPLICA_CLIENT};
pub use message::{decode_headers, encode_headers, InvalidMessage, Message};
pub use pool::MessagePool;
