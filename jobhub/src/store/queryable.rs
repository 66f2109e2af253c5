use chrono::{DateTime, Utc};

use crate::job::{
    query::{JobFilter, Scope},
    Job, JobStatus,
};

/// Predicates the in memory store evaluates against each record.
pub(super) trait Queryable {
    fn matches(&self, job: &Job) -> bool;
}

impl Queryable for JobFilter {
    fn matches(&self, job: &Job) -> bool {
        JobFilter::matches(self, job)
    }
}

impl Queryable for Scope {
    fn matches(&self, job: &Job) -> bool {
        self.includes(&job.owner)
    }
}

/// Matches jobs created at or after the instant.
pub(super) struct CreatedSince(pub(super) DateTime<Utc>);

impl Queryable for CreatedSince {
    fn matches(&self, job: &Job) -> bool {
        job.created_at >= self.0
    }
}

impl Queryable for JobStatus {
    fn matches(&self, job: &Job) -> bool {
        job.status == *self
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeDelta;

    use crate::job::{JobId, Lane, NewJob, Owner};

    use super::*;

    fn job(owner: Owner) -> Job {
        let now = Utc::now();
        NewJob {
            id: JobId::new(),
            task_type: "upload_process".to_owned(),
            lane: Lane::Default,
            owner,
            input: serde_json::Value::Null,
            max_retries: 3,
            created_at: now,
            expires_at: now + TimeDelta::hours(24),
        }
        .into_job()
    }

    #[test]
    fn query_matches() {
        let job = job(Owner::user(4).with_tenant(2));

        let matching: [&dyn Queryable; 6] = [
            &JobFilter::new(Scope::All),
            &JobFilter::new(Scope::User(4)).with_status(JobStatus::Queued),
            &JobFilter::new(Scope::Tenant(2)).with_task_type("upload_process"),
            &Scope::Tenant(2),
            &CreatedSince(job.created_at),
            &JobStatus::Queued,
        ];
        let not_matching: [&dyn Queryable; 5] = [
            &JobFilter::new(Scope::User(5)),
            &JobFilter::new(Scope::All).with_status(JobStatus::Failed),
            &JobFilter::new(Scope::All).with_task_type("send_email"),
            &CreatedSince(job.created_at + TimeDelta::milliseconds(1)),
            &JobStatus::Completed,
        ];

        for query in matching {
            assert!(query.matches(&job));
        }
        for query in not_matching {
            assert!(!query.matches(&job));
        }
    }
}
