// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf messages exchanged over supervisor sockets.
//!
//! The schema is declared with prost derives directly, so no `protoc` step is
//! needed at build time. Tags are part of the wire contract and must never be
//! reused.
//!
//! | Dir | Message | Effect |
//! |-----|---------|--------|
//! | W→S | `Hello` | first frame, binds the connection to a worker id |
//! | W→S | `Online` | worker is accepting traffic |
//! | W→S | `HealthReport` | refreshes stats and `last_health_at` |
//! | W→S | `RequestServed` | increments the request counter |
//! | W→S | `WorkerError` | increments the error counter |
//! | W→S | `DrainReady` | in-flight work finished, safe to terminate |
//! | S→W | `Drain` | stop accepting, finish in-flight, reply `DrainReady` |
//!
//! A `WorkerMessage` whose `kind` is unset (an unknown tag from a newer
//! worker) decodes successfully; receivers log and ignore it.

/// First frame a worker sends after connecting to the IPC socket.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
    /// Spawn id handed to the worker in `OPSPLANE_WORKER_ID`.
    #[prost(string, tag = "1")]
    pub worker_id: ::prost::alloc::string::String,
    /// Stable slot index (`WORKER_INDEX`).
    #[prost(uint32, tag = "2")]
    pub worker_index: u32,
    /// OS process id of the worker.
    #[prost(uint32, tag = "3")]
    pub pid: u32,
}

/// Worker readiness notification.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Online {}

/// Periodic worker health sample.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct HealthReport {
    /// CPU utilisation in percent.
    #[prost(double, tag = "1")]
    pub cpu: f64,
    /// Memory utilisation in percent.
    #[prost(double, tag = "2")]
    pub memory_pct: f64,
    /// Requests served since the worker started.
    #[prost(uint64, tag = "3")]
    pub requests: u64,
    /// Errors since the worker started.
    #[prost(uint64, tag = "4")]
    pub errors: u64,
    /// Recent average response time in milliseconds.
    #[prost(double, tag = "5")]
    pub response_time_ms: f64,
}

/// A single request was served.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct RequestServed {}

/// A worker-side error worth counting.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerError {
    #[prost(string, tag = "1")]
    pub error: ::prost::alloc::string::String,
}

/// Drain finished on the worker side.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct DrainReady {}

/// Worker to supervisor envelope.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerMessage {
    #[prost(oneof = "worker_message::Kind", tags = "1, 2, 3, 4, 5")]
    pub kind: ::core::option::Option<worker_message::Kind>,
}

/// Nested message and enum types in `WorkerMessage`.
pub mod worker_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Online(super::Online),
        #[prost(message, tag = "2")]
        Health(super::HealthReport),
        #[prost(message, tag = "3")]
        Request(super::RequestServed),
        #[prost(message, tag = "4")]
        Error(super::WorkerError),
        #[prost(message, tag = "5")]
        DrainReady(super::DrainReady),
    }
}

impl WorkerMessage {
    pub fn online() -> Self {
        Self {
            kind: Some(worker_message::Kind::Online(Online {})),
        }
    }

    pub fn health(report: HealthReport) -> Self {
        Self {
            kind: Some(worker_message::Kind::Health(report)),
        }
    }

    pub fn request_served() -> Self {
        Self {
            kind: Some(worker_message::Kind::Request(RequestServed {})),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            kind: Some(worker_message::Kind::Error(WorkerError {
                error: error.into(),
            })),
        }
    }

    pub fn drain_ready() -> Self {
        Self {
            kind: Some(worker_message::Kind::DrainReady(DrainReady {})),
        }
    }

    /// Short label used in logs.
    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            Some(worker_message::Kind::Online(_)) => "online",
            Some(worker_message::Kind::Health(_)) => "health",
            Some(worker_message::Kind::Request(_)) => "request",
            Some(worker_message::Kind::Error(_)) => "error",
            Some(worker_message::Kind::DrainReady(_)) => "drain_ready",
            None => "unknown",
        }
    }
}

/// Request a worker to drain.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Drain {}

/// Supervisor to worker envelope.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SupervisorMessage {
    #[prost(oneof = "supervisor_message::Kind", tags = "1")]
    pub kind: ::core::option::Option<supervisor_message::Kind>,
}

/// Nested message and enum types in `SupervisorMessage`.
pub mod supervisor_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Drain(super::Drain),
    }
}

impl SupervisorMessage {
    pub fn drain() -> Self {
        Self {
            kind: Some(supervisor_message::Kind::Drain(Drain {})),
        }
    }

    pub fn is_drain(&self) -> bool {
        matches!(self.kind, Some(supervisor_message::Kind::Drain(_)))
    }
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct StatusRequest {}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ReloadRequest {}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ShutdownRequest {}

/// Operator control request sent to the supervisor control socket.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControlRequest {
    #[prost(oneof = "control_request::Kind", tags = "1, 2, 3")]
    pub kind: ::core::option::Option<control_request::Kind>,
}

/// Nested message and enum types in `ControlRequest`.
pub mod control_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Status(super::StatusRequest),
        #[prost(message, tag = "2")]
        Reload(super::ReloadRequest),
        #[prost(message, tag = "3")]
        Shutdown(super::ShutdownRequest),
    }
}

impl ControlRequest {
    pub fn status() -> Self {
        Self {
            kind: Some(control_request::Kind::Status(StatusRequest {})),
        }
    }

    pub fn reload() -> Self {
        Self {
            kind: Some(control_request::Kind::Reload(ReloadRequest {})),
        }
    }

    pub fn shutdown() -> Self {
        Self {
            kind: Some(control_request::Kind::Shutdown(ShutdownRequest {})),
        }
    }
}

/// Operator control response. `body` carries a JSON document.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ControlResponse {
    #[prost(bool, tag = "1")]
    pub ok: bool,
    #[prost(string, tag = "2")]
    pub body: ::prost::alloc::string::String,
    #[prost(string, optional, tag = "3")]
    pub error: ::core::option::Option<::prost::alloc::string::String>,
}

impl ControlResponse {
    pub fn success(body: impl Into<String>) -> Self {
        Self {
            ok: true,
            body: body.into(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            body: String::new(),
            error: Some(error.into()),
        }
    }
}
