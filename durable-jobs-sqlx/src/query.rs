use durable_jobs::store::Query;
use sqlx::{Postgres, QueryBuilder};

use crate::types::JobStatus;

pub(crate) const JOB_COLUMNS: &str = "id, job_type, payload, status, attempts, max_attempts, \
    next_run_at, locked_by, locked_at, expires_at, idempotency_key, error_message, result, \
    inserted_at, updated_at";

pub(crate) trait ToQuery {
    fn query(&self) -> QueryBuilder<'_, Postgres>;
}

impl ToQuery for Query<'_> {
    fn query(&self) -> QueryBuilder<'_, Postgres> {
        let mut builder = QueryBuilder::new("SELECT ");
        builder.push(JOB_COLUMNS);
        builder.push(" FROM durable_jobs WHERE");
        handle_query(&mut builder, self);
        builder.push(" ORDER BY id");
        builder
    }
}

fn handle_query<'a>(builder: &mut QueryBuilder<'a, Postgres>, query: &'a Query<'_>) {
    match query {
        Query::All => {
            builder.push(" TRUE");
        }
        Query::Not(inner) => {
            builder.push(" NOT");
            handle_query(builder, inner);
        }
        Query::And(queries) => handle_group(builder, queries, " AND", " TRUE"),
        Query::Or(queries) => handle_group(builder, queries, " OR", " FALSE"),
        Query::IdEquals(id) => {
            builder.push(" id = ");
            builder.push_bind(i64::from(*id));
        }
        Query::JobTypeEqual(job_type) => {
            builder.push(" job_type = ");
            builder.push_bind(*job_type);
        }
        Query::StatusEqual(status) => {
            builder.push(" status = ");
            builder.push_bind(JobStatus::from(*status));
        }
        Query::IdempotencyKeyEqual(key) => {
            builder.push(" idempotency_key = ");
            builder.push_bind(*key);
        }
        Query::PayloadEquals(payload) => {
            builder.push(" payload = ");
            builder.push_bind(payload);
        }
        Query::NextRunAtBefore(next_run_at) => {
            builder.push(" next_run_at < ");
            builder.push_bind(*next_run_at);
        }
        Query::NextRunAtAfter(next_run_at) => {
            builder.push(" next_run_at > ");
            builder.push_bind(*next_run_at);
        }
    }
}

fn handle_group<'a>(
    builder: &mut QueryBuilder<'a, Postgres>,
    queries: &'a [Query<'_>],
    separator: &str,
    empty: &str,
) {
    match queries.split_last() {
        None => {
            builder.push(empty);
        }
        Some((last, elements)) => {
            builder.push(" (");
            elements.iter().for_each(|query| {
                handle_query(builder, query);
                builder.push(separator);
            });
            handle_query(builder, last);
            builder.push(" )");
        }
    }
}
