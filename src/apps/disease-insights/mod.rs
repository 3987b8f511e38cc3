// Copyright (c), Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

pub mod endpoints;
pub mod prompts;
pub mod types;

pub use endpoints::{router, router_with_frontend, SESSION_HEADER};
pub use types::*;
