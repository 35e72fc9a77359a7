use crate::types::{JobEvent, JobStatus};

impl JobStatus {
    /// The single transition function for jobs. `None` means the event is not
    /// legal from this status and must be ignored.
    ///
    /// ```text
    /// pending  --SpawnRequested--> starting
    /// starting --Spawned---------> running
    /// starting/running --Exited--> succeeded | failed
    /// pending/starting --SpawnFailed--> failed
    /// pending/starting/running --Cancel--> cancelled
    /// ```
    pub fn apply(self, event: &JobEvent) -> Option<JobStatus> {
        use JobStatus::*;

        match (self, event) {
            (Pending, JobEvent::SpawnRequested) => Some(Starting),
            (Starting, JobEvent::Spawned) => Some(Running),
            (Starting | Running, JobEvent::Exited { success: true }) => Some(Succeeded),
            (Starting | Running, JobEvent::Exited { success: false }) => Some(Failed),
            (Pending | Starting, JobEvent::SpawnFailed) => Some(Failed),
            (Pending | Starting | Running, JobEvent::Cancel) => Some(Cancelled),
            _ => None,
        }
    }
}
