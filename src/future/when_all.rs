// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use std::{cell::RefCell, rc::Rc};

use crate::{
    error::{Result, RockpoolError},
    future::{Future, Promise},
};

/// The outcome of one input future of a [`when_all`] gather.
#[derive(Debug)]
pub enum AnyResult<T> {
    /// The input resolved with a value.
    Value(T),
    /// The input resolved with (or was reduced to) an exception.
    Exception(RockpoolError),
}

impl<T> AnyResult<T> {
    /// True iff this input resolved successfully.
    pub fn is_value(&self) -> bool {
        matches!(self, AnyResult::Value(_))
    }

    /// The value, if this input resolved successfully.
    pub fn value(&self) -> Option<&T> {
        match self {
            AnyResult::Value(value) => Some(value),
            AnyResult::Exception(_) => None,
        }
    }

    /// The exception, if this input failed.
    pub fn exception(&self) -> Option<&RockpoolError> {
        match self {
            AnyResult::Value(_) => None,
            AnyResult::Exception(exception) => Some(exception),
        }
    }
}

struct Gather<T: 'static> {
    promise: Promise<Vec<AnyResult<T>>>,
    results: Vec<Option<AnyResult<T>>>,
    remaining: usize,
}

fn complete<T: 'static>(
    gather: &Rc<RefCell<Gather<T>>>,
    index: usize,
    outcome: AnyResult<T>,
) -> Result<()> {
    let mut gather = gather.borrow_mut();
    debug_assert!(gather.results[index].is_none());
    gather.results[index] = Some(outcome);
    gather.remaining -= 1;
    if gather.remaining > 0 {
        return Ok(());
    }
    let results = gather
        .results
        .drain(..)
        .map(|slot| slot.unwrap())
        .collect();
    gather.promise.set_value(results)
}

/// Gathers a batch of futures into a single future.
///
/// The output future resolves exactly once, when the last input resolves,
/// with one [`AnyResult`] per input in input order. It never resolves
/// with an exception itself: a failed input simply shows up as
/// [`AnyResult::Exception`] in its slot. All input futures must belong to
/// the same reactor and become non-valid on entry.
///
/// # Panics
///
/// Panics if `futures` is empty or if any input is no longer valid.
///
/// # Examples
///
/// ```
/// use rockpool::{
///     future::{when_all, Promise},
///     Reactor,
/// };
///
/// let reactor = Reactor::new();
/// let first = Promise::new(&reactor);
/// let second = Promise::new(&reactor);
///
/// let mut gathered = when_all(vec![
///     first.take_future().unwrap(),
///     second.take_future().unwrap(),
/// ]);
/// gathered
///     .on_completion(|results| {
///         assert_eq!(results[0].value(), Some(&1));
///         assert_eq!(results[1].value(), Some(&2));
///         Ok(())
///     })
///     .unwrap();
///
/// first.set_value(1).unwrap();
/// second.set_value(2).unwrap();
/// reactor.run().unwrap();
/// ```
pub fn when_all<T, I>(futures: I) -> Future<Vec<AnyResult<T>>>
where
    T: 'static,
    I: IntoIterator<Item = Future<T>>,
{
    let futures: Vec<Future<T>> = futures.into_iter().collect();
    assert!(!futures.is_empty(), "when_all requires at least one future");
    assert!(
        futures.iter().all(Future::is_valid),
        "when_all requires valid input futures"
    );

    let reactor = futures[0].reactor().clone();
    let count = futures.len();
    let promise = Promise::new(&reactor);
    let output = promise.take_future().unwrap();
    let gather = Rc::new(RefCell::new(Gather {
        promise,
        results: (0..count).map(|_| None).collect(),
        remaining: count,
    }));

    for (index, mut future) in futures.into_iter().enumerate() {
        let on_result = {
            let gather = Rc::clone(&gather);
            move |result| complete(&gather, index, AnyResult::Value(result))
        };
        let on_exception = {
            let gather = Rc::clone(&gather);
            move |exception| complete(&gather, index, AnyResult::Exception(exception))
        };
        future.on_completion_or_else(on_result, on_exception).unwrap();
    }
    output
}
