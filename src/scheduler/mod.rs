//! Admission Scheduler (C3) — spec §4.2.
//!
//! Grounded on `Scheduler.schedule` / `__try_to_schedule` /
//! `__check_resource_limits` in `scheduler/schedulers/native.py`. The
//! reference implementation assigns `self.__reserved[identifier] = limits`
//! twice in a row inside `__try_to_schedule`; SPEC_FULL.md resolves this
//! as an accidental duplicate (Open Question, §9) and performs the insert
//! exactly once here.

use std::collections::HashMap;

use bytesize::ByteSize;
use tracing::debug;

use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub identifier: String,
    pub memory_size: u64,
    pub cpu_model: Option<String>,
}

pub trait Priority {
    fn priority(&self) -> i64;
}

pub struct NodeResources {
    pub memory_size: u64,
    pub cpu_model: Option<String>,
}

pub struct AdmissionScheduler {
    node: NodeResources,
    reserved_memory: u64,
    reserved: HashMap<String, ResourceRequest>,
}

impl AdmissionScheduler {
    pub fn new(node: NodeResources) -> Self {
        AdmissionScheduler {
            node,
            reserved_memory: 0,
            reserved: HashMap::new(),
        }
    }

    pub fn reserved_memory(&self) -> u64 {
        self.reserved_memory
    }

    pub fn is_reserved(&self, identifier: &str) -> bool {
        self.reserved.contains_key(identifier)
    }

    fn check_resource_limits(&self, req: &ResourceRequest) -> Result<(), PipelineError> {
        if let Some(wanted) = &req.cpu_model {
            if self.node.cpu_model.as_deref() != Some(wanted.as_str()) {
                return Err(PipelineError::SchedulerError {
                    identifier: req.identifier.clone(),
                    reason: format!(
                        "host CPU model is not {wanted} (has only {:?})",
                        self.node.cpu_model
                    ),
                });
            }
        }
        if req.memory_size > self.node.memory_size {
            return Err(PipelineError::SchedulerError {
                identifier: req.identifier.clone(),
                reason: format!(
                    "host does not have {} bytes of RAM (has only {} bytes)",
                    req.memory_size, self.node.memory_size
                ),
            });
        }
        Ok(())
    }

    /// Attempts to reserve `req`. Returns `true` and records the reservation
    /// on success; `false` (no error) when the node simply doesn't have
    /// enough free memory right now — the caller tries again next
    /// invocation. A hard mismatch (CPU model, exceeds physical memory)
    /// surfaces as `SchedulerError`.
    fn try_to_schedule(&mut self, req: ResourceRequest) -> Result<bool, PipelineError> {
        self.check_resource_limits(&req)?;
        if req.memory_size <= self.node.memory_size.saturating_sub(self.reserved_memory) {
            self.reserved_memory += req.memory_size;
            debug!(
                "admitted {}: reserving {}, node now has {} of {} reserved",
                req.identifier,
                ByteSize(req.memory_size),
                ByteSize(self.reserved_memory),
                ByteSize(self.node.memory_size)
            );
            self.reserved.insert(req.identifier.clone(), req);
            Ok(true)
        } else {
            debug!(
                "{} stays pending: needs {}, only {} free",
                req.identifier,
                ByteSize(req.memory_size),
                ByteSize(self.node.memory_size.saturating_sub(self.reserved_memory))
            );
            Ok(false)
        }
    }

    /// Spec §4.2 algorithm: sort pending tasks by `priority_fn` ascending,
    /// admit in order; then admit pending jobs not already reserved.
    pub fn schedule<T: Priority>(
        &mut self,
        pending_tasks: Vec<(ResourceRequest, T)>,
        pending_jobs: Vec<(ResourceRequest, T)>,
    ) -> Result<(Vec<String>, Vec<String>), PipelineError> {
        let mut tasks = pending_tasks;
        tasks.sort_by_key(|(_, item)| item.priority());

        let mut tasks_to_start = Vec::new();
        for (req, _) in tasks {
            let identifier = req.identifier.clone();
            if self.try_to_schedule(req)? {
                tasks_to_start.push(identifier);
            }
        }

        let mut jobs_to_start = Vec::new();
        for (req, _) in pending_jobs {
            if self.reserved.contains_key(&req.identifier) {
                continue;
            }
            let identifier = req.identifier.clone();
            if self.try_to_schedule(req)? {
                jobs_to_start.push(identifier);
            }
        }

        Ok((tasks_to_start, jobs_to_start))
    }

    /// Releases a reservation. Idempotent only when `id` was already
    /// explicitly cancelled; releasing an active reservation twice without
    /// an intervening `cancel` is a fatal accounting bug (spec §4.2).
    pub fn release(&mut self, identifier: &str) {
        match self.reserved.remove(identifier) {
            Some(req) => {
                self.reserved_memory -= req.memory_size;
            }
            None => panic!("double release of scheduler reservation for {identifier}"),
        }
    }

    /// Explicit cancellation, after which `release` on the same id is a
    /// no-op rather than a panic.
    pub fn cancel(&mut self, identifier: &str) {
        if let Some(req) = self.reserved.remove(identifier) {
            self.reserved_memory -= req.memory_size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fifo(i64);
    impl Priority for Fifo {
        fn priority(&self) -> i64 {
            self.0
        }
    }

    fn req(id: &str, mem: u64) -> ResourceRequest {
        ResourceRequest {
            identifier: id.to_string(),
            memory_size: mem,
            cpu_model: None,
        }
    }

    /// Spec §8 scenario S5: node=8GiB, reserved=6GiB, T1=1GiB admitted,
    /// T2=3GiB stays pending.
    #[test]
    fn s5_scheduler_gating() {
        const GIB: u64 = 1 << 30;
        let mut sched = AdmissionScheduler::new(NodeResources {
            memory_size: 8 * GIB,
            cpu_model: None,
        });
        sched.reserved_memory = 6 * GIB;

        let pending_tasks = vec![
            (req("T1", 1 * GIB), Fifo(0)),
            (req("T2", 3 * GIB), Fifo(1)),
        ];
        let (tasks, jobs) = sched.schedule(pending_tasks, vec![]).unwrap();

        assert_eq!(tasks, vec!["T1".to_string()]);
        assert!(jobs.is_empty());
        assert_eq!(sched.reserved_memory(), 7 * GIB);
        assert!(!sched.is_reserved("T2"));
    }

    #[test]
    fn memory_exceeding_node_capacity_is_fatal() {
        let mut sched = AdmissionScheduler::new(NodeResources {
            memory_size: 1024,
            cpu_model: None,
        });
        let err = sched.try_to_schedule(req("huge", 2048)).unwrap_err();
        assert!(matches!(err, PipelineError::SchedulerError { .. }));
    }

    #[test]
    #[should_panic]
    fn double_release_on_active_reservation_panics() {
        let mut sched = AdmissionScheduler::new(NodeResources {
            memory_size: 1024,
            cpu_model: None,
        });
        sched.try_to_schedule(req("t", 10)).unwrap();
        sched.release("t");
        sched.release("t");
    }

    #[test]
    fn cancel_then_release_is_not_fatal() {
        let mut sched = AdmissionScheduler::new(NodeResources {
            memory_size: 1024,
            cpu_model: None,
        });
        sched.try_to_schedule(req("t", 10)).unwrap();
        sched.cancel("t");
        sched.cancel("t");
    }
}
