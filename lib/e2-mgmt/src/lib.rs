/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

mod protocol;
pub use protocol::{
    encode_request, parse_response, FieldReader, MgmtError, MgmtField, MgmtOp, ProxyState,
    RecordValue, MAX_FRAME_SIZE,
};

mod client;
pub use client::{MgmtClient, MAX_CONN_TRIES};
