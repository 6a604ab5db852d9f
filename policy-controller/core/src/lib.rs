#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Core types shared by the sync controllers: GVK identifiers and sets, object
//! keys, retry policies, and the interfaces through which the controllers reach
//! the Kubernetes API, the policy engine's data cache, the watch registrar, and
//! the readiness tracker.

pub mod backoff;
pub mod client;
pub mod data;
mod gvk;
pub mod object;
pub mod readiness;
pub mod watch;

pub use self::{
    backoff::{Attempt, Backoff, RetryError},
    client::{ClientError, Reader, Writer},
    data::{DataClient, DataError, RemoveTarget, Responses},
    gvk::{Gvk, GvkSet},
    object::ObjectKey,
    readiness::{Expectations, Tracker},
    watch::{PauseGuard, Registrar, WatchError},
};
pub use tokio_util::sync::CancellationToken;
