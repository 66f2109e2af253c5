use chrono::{DateTime, Utc};
use jobhub::job::query::{JobFilter, Page, Scope};
use sqlx::{Postgres, QueryBuilder};

use crate::types::{JobStatus, JOB_COLUMNS};

pub(crate) trait ToQuery {
    fn push_conditions<'a>(&'a self, builder: &mut QueryBuilder<'a, Postgres>);
}

impl ToQuery for Scope {
    fn push_conditions<'a>(&'a self, builder: &mut QueryBuilder<'a, Postgres>) {
        match self {
            Scope::All => {
                builder.push(" TRUE");
            }
            Scope::User(user_id) => {
                builder.push(" owner_user_id = ");
                builder.push_bind(*user_id);
            }
            Scope::Tenant(tenant_id) => {
                builder.push(" owner_tenant_id = ");
                builder.push_bind(*tenant_id);
            }
        }
    }
}

impl ToQuery for JobFilter {
    fn push_conditions<'a>(&'a self, builder: &mut QueryBuilder<'a, Postgres>) {
        self.scope.push_conditions(builder);
        if let Some(status) = self.status {
            builder.push(" AND status = ");
            builder.push_bind::<JobStatus>(status.into());
        }
        if let Some(task_type) = &self.task_type {
            builder.push(" AND task_type = ");
            builder.push_bind(task_type);
        }
    }
}

pub(crate) fn list(filter: &JobFilter, page: Page) -> QueryBuilder<'_, Postgres> {
    let mut builder = QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobhub_jobs WHERE"));
    filter.push_conditions(&mut builder);
    // id breaks ties between jobs created in the same microsecond
    builder.push(" ORDER BY created_at DESC, id LIMIT ");
    builder.push_bind(i64::from(page.size()));
    builder.push(" OFFSET ");
    builder.push_bind(page.offset() as i64);
    builder
}

pub(crate) fn count(filter: &JobFilter) -> QueryBuilder<'_, Postgres> {
    let mut builder = QueryBuilder::new("SELECT COUNT(*) FROM jobhub_jobs WHERE");
    filter.push_conditions(&mut builder);
    builder
}

pub(crate) fn stats(scope: &Scope, since: DateTime<Utc>) -> QueryBuilder<'_, Postgres> {
    let mut builder = QueryBuilder::new(
        r#"SELECT
            COUNT(*) AS total,
            COUNT(*) FILTER (WHERE status = 'queued') AS queued,
            COUNT(*) FILTER (WHERE status = 'processing') AS processing,
            COUNT(*) FILTER (WHERE status = 'completed') AS completed,
            COUNT(*) FILTER (WHERE status = 'failed') AS failed,
            COUNT(*) FILTER (WHERE created_at >= "#,
    );
    builder.push_bind(since);
    builder.push(
        r#") AS recent,
            (AVG(EXTRACT(EPOCH FROM completed_at - started_at))
                FILTER (WHERE status = 'completed' AND created_at >= "#,
    );
    builder.push_bind(since);
    builder.push("))::float8 AS avg_processing_secs FROM jobhub_jobs WHERE");
    scope.push_conditions(&mut builder);
    builder
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn list_query_filters_and_pages() {
        let filter = JobFilter::new(Scope::User(7))
            .with_status(jobhub::job::JobStatus::Failed)
            .with_task_type("send_email");

        let query = list(&filter, Page::new(Some(3), Some(20)));
        let sql = query.sql();

        assert!(sql.contains("WHERE owner_user_id = $1 AND status = $2 AND task_type = $3"));
        assert!(sql.ends_with("ORDER BY created_at DESC, id LIMIT $4 OFFSET $5"));
    }

    #[test]
    fn count_query_for_everyone_has_no_binds() {
        let filter = JobFilter::new(Scope::All);

        assert_eq!(
            count(&filter).sql(),
            "SELECT COUNT(*) FROM jobhub_jobs WHERE TRUE"
        );
    }

    #[test]
    fn stats_query_scopes_by_tenant() {
        let scope = Scope::Tenant(4);

        let query = stats(&scope, Utc::now());
        let sql = query.sql();

        assert!(sql.contains("created_at >= $1"));
        assert!(sql.contains("created_at >= $2"));
        assert!(sql.ends_with("WHERE owner_tenant_id = $3"));
    }
}
