//! Request/response over a topic exchange.
//!
//! A [`Worker`] consumes `{q, qid}` envelopes from `<service>_req`, bound to
//! `<topic>.request.*`, hands them to a [`Dispatch`] and lets it answer on
//! `<topic>.response.<qid>` through a [`Responder`]. The broker itself sits
//! behind the [`Broker`] / [`BrokerConnection`] traits.

pub mod bus;
pub mod codec;
pub mod error;
pub mod handler;
pub mod requester;
pub mod responder;
pub mod supervisor;
pub mod topology;
pub mod types;
pub mod worker;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

pub use bus::{
    Acknowledger, Broker, BrokerConnection, Delivery, DeliveryStream, ExchangeOptions,
    QueueOptions,
};
pub use error::{MessagingError, Result};
pub use handler::{dispatch_fn, Dispatch};
pub use requester::Requester;
pub use responder::Responder;
pub use supervisor::{ConnectionSupervisor, Session};
pub use topology::{declare_topology, declare_worker_topology};
pub use types::{
    binding_key, request_queue_name, response_routing_key_template, Envelope, WorkerConfig,
    WorkerIdentity,
};
pub use worker::{Worker, WorkerState};
