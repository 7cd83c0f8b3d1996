// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! # Rockpool - a deterministic reactor for co-simulation middleware.
//!
//! ## What is Rockpool
//!
//! Rockpool is the event-loop core of a distributed co-simulation bus: a
//! strictly single-threaded reactor that multiplexes readiness on
//! message-oriented sockets together with timers and immediate (next-tick)
//! events, plus a push-style [`Promise`]/[`Future`] pair layered on top of
//! it, with monadic chaining ([`chain`]) and fan-in ([`when_all`]).
//!
//! Every other subsystem of such a bus (RPC machinery, model validation,
//! simulation stepping) sits on top of this crate, so its contracts are
//! deliberately narrow and deterministic: callbacks fire in a documented
//! order, registrations changed during dispatch behave predictably, and a
//! promise that is dropped unresolved surfaces a distinguishable
//! broken-promise error rather than vanishing.
//!
//! ```
//! use rockpool::{future::Promise, Reactor};
//!
//! let reactor = Reactor::new();
//! let promise = Promise::new(&reactor);
//! let mut future = promise.take_future().unwrap();
//! future
//!     .on_completion(|value: u32| {
//!         assert_eq!(value, 42);
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! // The handler is never invoked synchronously. It runs at the start of
//! // the next dispatch pass, so a `run()` is required to observe it.
//! promise.set_value(42).unwrap();
//! reactor.run().unwrap();
//! ```
//!
//! ## Single-threaded by construction
//!
//! Nothing in this crate synchronizes. The reactor, promises and futures
//! are single-owner objects that must stay on one thread; reference counts
//! are plain [`Rc`](std::rc::Rc)s and all interior mutability is
//! `RefCell`/`Cell`. Multi-threaded callers have to marshal work onto the
//! reactor thread themselves.
//!
//! The only blocking point is [`Reactor::run`], which parks inside the
//! [`Poller`] between dispatch passes. Handlers always run to completion;
//! there is no implicit yielding and no work stealing.
//!
//! ## Dispatch order
//!
//! One pass of the loop is: drain the immediate-event queue (FIFO, and
//! events queued during the drain still run in the same pass), poll
//! sockets with a timeout capped by the earliest timer deadline, fire due
//! timers in ascending `(deadline, id)` order, then fire ready sockets in
//! registration order. Timers advance by their interval rather than from
//! "now", so a periodic timer keeps a drift-free cadence even when a pass
//! runs late.
//!
//! ## Errors
//!
//! Handlers return [`Result`]; an error from any handler stops the loop
//! and propagates out of [`Reactor::run`] with all registrations intact.
//! The same composite error type travels the promise exception channel,
//! so user error values, I/O faults and the broken-promise case are all
//! matchable in one place. See [`RockpoolError`].
//!
//! [`Promise`]: future::Promise
//! [`Future`]: future::Future
//! [`chain`]: future::chain
//! [`when_all`]: future::when_all

#[cfg(test)]
macro_rules! make_shared_var {
    ($var:expr, $( $name:ident ),+ ) => {
        let local_name = Rc::new($var);
        $( let $name = local_name.clone(); )*
    }
}

#[cfg(test)]
macro_rules! make_shared_var_mut {
    ($var:expr, $( $name:ident ),+ ) => {
        let local_name = Rc::new(RefCell::new($var));
        $( let $name = local_name.clone(); )*
    }
}

mod clock;
mod error;
mod poller;
mod reactor;

pub mod future;

pub use crate::{
    clock::{Clock, MonotonicClock},
    error::{Result, RockpoolError},
    poller::{PollEntry, PollFlags, Poller, SysPoller},
    reactor::{EventHandler, Reactor, Repeat, SocketHandler, TimerHandler, TimerId},
};
