// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Remote command execution in pods.

pub mod executor;

pub use executor::{
    EndpointRole, ExecFailure, ExecOutput, ExecRequest, ExecResult, ExecTransport,
    KubeExecTransport, OutputObserver, OutputStream, RemoteExecutor, TracingObserver,
};
