/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

mod status;
pub use status::SslStatus;

mod io;
use io::EngineIo;

mod engine;
pub use engine::SslEngine;

mod server_name;
pub use server_name::{ServerName, ServerNameError};
