/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::{Arc, Mutex};

use crate::vc::TlsVc;

/// Event ids delivered to continuations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// A pre-accept hook is being offered the connection.
    PreAccept,
    /// An SNI hook is being offered the parsed client hello.
    Sni,
    ReadReady,
    ReadComplete,
    WriteReady,
    WriteComplete,
    Eos,
    Error(i32),
}

/// A continuation body. It only ever runs under its own mutex.
pub trait EventSink: Send {
    fn handle_event(&mut self, event: Event, vc: &Arc<TlsVc>);
}

/// A continuation: the handler plus the mutex it runs under.
pub type ContRef = Arc<Mutex<dyn EventSink>>;

/// The cooperative scheduler the engine runs on. Tasks scheduled here
/// must run soon, on any worker, exactly once.
pub trait Runtime: Send + Sync {
    fn schedule_imm(&self, task: Box<dyn ScheduledTask>);
}

pub trait ScheduledTask: Send {
    fn run(self: Box<Self>, rt: &Arc<dyn Runtime>);
}

/// Deliver `event` to `target` under the target's own mutex.
///
/// The caller may already hold other locks, so the target lock is only
/// tried: on contention a one-shot indirection task takes over, which
/// repeats the try-lock and either delivers or reschedules itself. The
/// scheduler is never blocked on a continuation mutex.
pub fn invoke_cont(rt: &Arc<dyn Runtime>, target: &ContRef, event: Event, vc: &Arc<TlsVc>) {
    if let Ok(mut sink) = target.try_lock() {
        sink.handle_event(event, vc);
    } else {
        rt.schedule_imm(Box::new(RetryInvoke {
            target: target.clone(),
            event,
            vc: vc.clone(),
        }));
    }
}

struct RetryInvoke {
    target: ContRef,
    event: Event,
    vc: Arc<TlsVc>,
}

impl ScheduledTask for RetryInvoke {
    fn run(self: Box<Self>, rt: &Arc<dyn Runtime>) {
        if let Ok(mut sink) = self.target.try_lock() {
            sink.handle_event(self.event, &self.vc);
        } else {
            rt.schedule_imm(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vc::test_util::{noop_poller, test_env, test_vc};

    struct Recorder {
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl EventSink for Recorder {
        fn handle_event(&mut self, event: Event, _vc: &Arc<TlsVc>) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[derive(Default)]
    struct QueueRuntime {
        tasks: Mutex<Vec<Box<dyn ScheduledTask>>>,
    }

    impl Runtime for QueueRuntime {
        fn schedule_imm(&self, task: Box<dyn ScheduledTask>) {
            self.tasks.lock().unwrap().push(task);
        }
    }

    fn run_all(rt: &Arc<QueueRuntime>) {
        loop {
            let queued = std::mem::take(&mut *rt.tasks.lock().unwrap());
            if queued.is_empty() {
                return;
            }
            let dyn_rt: Arc<dyn Runtime> = rt.clone();
            for t in queued {
                t.run(&dyn_rt);
            }
        }
    }

    #[test]
    fn inline_delivery_when_uncontended() {
        let rt = Arc::new(QueueRuntime::default());
        let env = test_env(rt.clone());
        let vc = test_vc(&env);
        let _nh = noop_poller();

        let events = Arc::new(Mutex::new(Vec::new()));
        let cont: ContRef = Arc::new(Mutex::new(Recorder {
            events: events.clone(),
        }));
        let rt_dyn: Arc<dyn Runtime> = rt.clone();
        invoke_cont(&rt_dyn, &cont, Event::PreAccept, &vc);

        assert!(rt.tasks.lock().unwrap().is_empty());
        assert_eq!(*events.lock().unwrap(), vec![Event::PreAccept]);
    }

    #[test]
    fn contended_delivery_goes_through_runtime() {
        let rt = Arc::new(QueueRuntime::default());
        let env = test_env(rt.clone());
        let vc = test_vc(&env);

        let events = Arc::new(Mutex::new(Vec::new()));
        let cont: ContRef = Arc::new(Mutex::new(Recorder {
            events: events.clone(),
        }));
        let held = cont.lock().unwrap();

        let rt_dyn: Arc<dyn Runtime> = rt.clone();
        invoke_cont(&rt_dyn, &cont, Event::Sni, &vc);
        // not delivered inline, an indirection task is waiting
        assert_eq!(rt.tasks.lock().unwrap().len(), 1);
        drop(held);

        run_all(&rt);
        assert_eq!(*events.lock().unwrap(), vec![Event::Sni]);
    }
}
