//! HTTP fetch client with retry/backoff/pacing, the relational store behind
//! the sync engine, and durable per-job checkpoints.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use parly_core::{
    bill_signature, role_signature, stage_signature, vote_signature, Bill, BillDetails, BillKey,
    BillRef, BillStage, MemberId, MemberRef, Role, Signature, Vote,
    SYNTHESIZED_MEMBER_ID_START,
};

/// Identifying header sent with every outbound request so the remote operator
/// can attribute and rate-limit this traffic.
pub const DEFAULT_USER_AGENT: &str = "ParlyDataCollector/1.0 (parliamentary data sync)";

// ---------------------------------------------------------------------------
// Fetch client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => match StatusCode::from_u16(*status) {
                Ok(status) => classify_status(status),
                Err(_) => RetryDisposition::NonRetryable,
            },
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 429, .. })
    }
}

/// Bounded exponential backoff. HTTP 429 gets a longer base than ordinary
/// transient failures (the source asks for real breathing room when it
/// rate-limits, so 5s/10s/20s instead of 1s/2s/4s at the defaults).
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub rate_limited_base: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            rate_limited_base: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize, rate_limited: bool) -> Duration {
        let base = if rate_limited {
            self.rate_limited_base
        } else {
            self.base_delay
        };
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        base.saturating_mul(factor).min(self.max_delay)
    }
}

/// Drives one fetch operation through the retry policy. Separated from the
/// HTTP client so the retry behavior is testable with a scripted attempt.
pub async fn fetch_attempts<T, F, Fut>(policy: &BackoffPolicy, mut attempt: F) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt_index = 0;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if err.disposition() == RetryDisposition::NonRetryable
                    || attempt_index >= policy.max_retries
                {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt_index, err.is_rate_limited());
                debug!(attempt = attempt_index + 1, ?delay, error = %err, "retrying fetch");
                tokio::time::sleep(delay).await;
                attempt_index += 1;
            }
        }
    }
}

/// Enforces the politeness contract: a fixed minimum interval between
/// outbound requests, shared by every caller holding the same pacer. The
/// backfill worker pool shares one pacer so the collective request rate
/// still honors the ceiling.
#[derive(Debug)]
pub struct Pacer {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Reserves the next request slot and sleeps until it arrives.
    pub async fn pause(&self) {
        let ready_at = {
            let mut slot = self.next_slot.lock().await;
            let now = Instant::now();
            let ready_at = match *slot {
                Some(prev) => prev.max(now),
                None => now,
            };
            *slot = Some(ready_at + self.min_interval);
            ready_at
        };
        tokio::time::sleep_until(ready_at).await;
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub min_request_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            min_request_interval: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacer: Arc<Pacer>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            pacer: Arc::new(Pacer::new(config.min_request_interval)),
            backoff: config.backoff,
        })
    }

    async fn attempt_once(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.pacer.pause().await;
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if status.is_success() {
            let body = resp.bytes().await?.to_vec();
            return Ok(body);
        }
        Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: resp.url().to_string(),
        })
    }

    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        debug!(url, "fetching");
        match fetch_attempts(&self.backoff, || self.attempt_once(url)).await {
            Ok(body) => {
                debug!(url, bytes = body.len(), "fetched");
                Ok(body)
            }
            Err(err) => {
                warn!(url, error = %err, "fetch failed");
                Err(err)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub owner_key: String,
    pub saved_at: DateTime<Utc>,
}

/// Durable cursor recording the last fully-committed owner of one entity job.
/// Injectable so tests can substitute an in-memory fake.
pub trait CheckpointStore: Send + Sync {
    fn load(&self) -> anyhow::Result<Option<Checkpoint>>;
    fn save(&self, owner_key: &str) -> anyhow::Result<()>;
    fn clear(&self) -> anyhow::Result<()>;
}

/// Two-line checkpoint file (owner key, RFC 3339 timestamp), written through
/// a temp file and an atomic rename.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn for_job(dir: impl AsRef<Path>, job_name: &str) -> Self {
        Self {
            path: dir.as_ref().join(format!("{job_name}_checkpoint.txt")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> anyhow::Result<Option<Checkpoint>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading checkpoint {}", self.path.display()))?;
        let mut lines = text.lines();
        let owner_key = match lines.next() {
            Some(line) if !line.trim().is_empty() => line.trim().to_string(),
            _ => {
                warn!(path = %self.path.display(), "malformed checkpoint file ignored");
                return Ok(None);
            }
        };
        let saved_at = lines
            .next()
            .and_then(|line| DateTime::parse_from_rfc3339(line.trim()).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Ok(Some(Checkpoint { owner_key, saved_at }))
    }

    fn save(&self, owner_key: &str) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating checkpoint dir {}", parent.display()))?;
        }
        let temp_path = self.path.with_extension("tmp");
        let contents = format!("{owner_key}\n{}\n", Utc::now().to_rfc3339());
        std::fs::write(&temp_path, contents)
            .with_context(|| format!("writing checkpoint temp {}", temp_path.display()))?;
        std::fs::rename(&temp_path, &self.path)
            .with_context(|| format!("renaming checkpoint into {}", self.path.display()))?;
        Ok(())
    }

    fn clear(&self) -> anyhow::Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("removing checkpoint {}", self.path.display()))?;
        }
        Ok(())
    }
}

/// In-memory checkpoint fake. Records every save so tests can assert the
/// cursor advanced through the expected owners.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    inner: std::sync::Mutex<MemoryCheckpointInner>,
}

#[derive(Debug, Default)]
struct MemoryCheckpointInner {
    current: Option<Checkpoint>,
    history: Vec<String>,
}

impl MemoryCheckpointStore {
    pub fn with_checkpoint(owner_key: &str) -> Self {
        let store = Self::default();
        store.save(owner_key).expect("memory checkpoint save");
        store
    }

    pub fn saved_keys(&self) -> Vec<String> {
        self.inner.lock().expect("checkpoint lock").history.clone()
    }

    pub fn current(&self) -> Option<Checkpoint> {
        self.inner.lock().expect("checkpoint lock").current.clone()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self) -> anyhow::Result<Option<Checkpoint>> {
        Ok(self.current())
    }

    fn save(&self, owner_key: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("checkpoint lock");
        inner.current = Some(Checkpoint {
            owner_key: owner_key.to_string(),
            saved_at: Utc::now(),
        });
        inner.history.push(owner_key.to_string());
        Ok(())
    }

    fn clear(&self) -> anyhow::Result<()> {
        self.inner.lock().expect("checkpoint lock").current = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Relational store
// ---------------------------------------------------------------------------

/// Constraint violations mean the diff engine or owner-creation ordering is
/// wrong, not that the remote source misbehaved; callers log them louder.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("storage error: {0}")]
    Io(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db) = err.as_database_error() {
            if db.is_unique_violation() || db.is_foreign_key_violation() || db.is_check_violation()
            {
                return StoreError::Constraint(db.to_string());
            }
        }
        StoreError::Io(err.to_string())
    }
}

/// The five-table relational store. Insert-only from the sync engine's point
/// of view; the single exception is `fill_bill_details`, which fills NULL
/// enrichment columns and never overwrites a present value.
#[async_trait]
pub trait Store: Send + Sync {
    /// Members with a real source ID, ascending, the stable owner order for
    /// the per-member jobs. Synthesized historical members are excluded
    /// because no remote URL exists for them.
    async fn fetchable_members(&self) -> Result<Vec<MemberRef>, StoreError>;

    /// All bills ascending by row ID, the stable owner order for the
    /// progress and backfill jobs.
    async fn all_bills(&self) -> Result<Vec<BillRef>, StoreError>;

    async fn role_signatures(&self, member: MemberId) -> Result<HashSet<Signature>, StoreError>;
    async fn vote_signatures(&self, member: MemberId) -> Result<HashSet<Signature>, StoreError>;
    async fn bill_signatures(
        &self,
        parliament: i32,
        session: i32,
    ) -> Result<HashSet<Signature>, StoreError>;
    async fn stage_signatures(&self, bill_id: i64) -> Result<HashSet<Signature>, StoreError>;

    /// Insert-ignore seed of member rows; returns how many were new.
    async fn insert_members(&self, members: &[MemberRef]) -> Result<u64, StoreError>;

    /// One transaction per owner: creates the member row if absent, then
    /// inserts the batch. All-or-nothing.
    async fn insert_roles(&self, member: &MemberRef, roles: &[Role]) -> Result<(), StoreError>;

    async fn insert_votes(&self, member: MemberId, votes: &[Vote]) -> Result<(), StoreError>;

    async fn insert_bills(&self, bills: &[Bill]) -> Result<(), StoreError>;

    async fn insert_stages(&self, bill_id: i64, stages: &[BillStage]) -> Result<(), StoreError>;

    /// Bills still missing any enrichment column, ascending by row ID.
    async fn bills_missing_details(&self) -> Result<Vec<BillRef>, StoreError>;

    /// Fills NULL enrichment columns only. Returns whether anything changed.
    async fn fill_bill_details(
        &self,
        bill_id: i64,
        details: &BillDetails,
    ) -> Result<bool, StoreError>;
}

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to database")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        MIGRATOR.run(&self.pool).await.context("running migrations")
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn fetchable_members(&self) -> Result<Vec<MemberRef>, StoreError> {
        let rows = sqlx::query(
            "SELECT member_id, name FROM members WHERE member_id < $1 ORDER BY member_id",
        )
        .bind(SYNTHESIZED_MEMBER_ID_START)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(MemberRef {
                    id: MemberId(row.try_get("member_id")?),
                    name: row.try_get("name")?,
                })
            })
            .collect()
    }

    async fn all_bills(&self) -> Result<Vec<BillRef>, StoreError> {
        let rows = sqlx::query(
            "SELECT bill_id, bill_number, parliament_number, session_number \
             FROM bills ORDER BY bill_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(BillRef {
                    id: row.try_get("bill_id")?,
                    key: BillKey {
                        number: row.try_get("bill_number")?,
                        parliament: row.try_get("parliament_number")?,
                        session: row.try_get("session_number")?,
                    },
                })
            })
            .collect()
    }

    async fn role_signatures(&self, member: MemberId) -> Result<HashSet<Signature>, StoreError> {
        let rows = sqlx::query(
            "SELECT role_kind, start_date, parliament_number, session_number, \
                    committee_name, organization_name \
             FROM roles WHERE member_id = $1",
        )
        .bind(member.0)
        .fetch_all(&self.pool)
        .await?;
        let mut signatures = HashSet::with_capacity(rows.len());
        for row in &rows {
            let kind: String = row.try_get("role_kind")?;
            let start_date: Option<NaiveDate> = row.try_get("start_date")?;
            let parliament: Option<i32> = row.try_get("parliament_number")?;
            let session: Option<i32> = row.try_get("session_number")?;
            let committee: Option<String> = row.try_get("committee_name")?;
            let organization: Option<String> = row.try_get("organization_name")?;
            signatures.insert(role_signature(
                member,
                &kind,
                start_date,
                parliament,
                session,
                committee.as_deref(),
                organization.as_deref(),
            ));
        }
        Ok(signatures)
    }

    async fn vote_signatures(&self, member: MemberId) -> Result<HashSet<Signature>, StoreError> {
        let rows = sqlx::query(
            "SELECT parliament_number, session_number, vote_date, vote_topic \
             FROM votes WHERE member_id = $1",
        )
        .bind(member.0)
        .fetch_all(&self.pool)
        .await?;
        let mut signatures = HashSet::with_capacity(rows.len());
        for row in &rows {
            let parliament: i32 = row.try_get("parliament_number")?;
            let session: i32 = row.try_get("session_number")?;
            let vote_date: NaiveDate = row.try_get("vote_date")?;
            let topic: String = row.try_get("vote_topic")?;
            signatures.insert(vote_signature(member, parliament, session, vote_date, &topic));
        }
        Ok(signatures)
    }

    async fn bill_signatures(
        &self,
        parliament: i32,
        session: i32,
    ) -> Result<HashSet<Signature>, StoreError> {
        let rows = sqlx::query(
            "SELECT bill_number FROM bills \
             WHERE parliament_number = $1 AND session_number = $2",
        )
        .bind(parliament)
        .bind(session)
        .fetch_all(&self.pool)
        .await?;
        let mut signatures = HashSet::with_capacity(rows.len());
        for row in &rows {
            let number: String = row.try_get("bill_number")?;
            signatures.insert(bill_signature(&BillKey::new(number, parliament, session)));
        }
        Ok(signatures)
    }

    async fn stage_signatures(&self, bill_id: i64) -> Result<HashSet<Signature>, StoreError> {
        let rows = sqlx::query(
            "SELECT stage_name, observed_date FROM bill_progress WHERE bill_id = $1",
        )
        .bind(bill_id)
        .fetch_all(&self.pool)
        .await?;
        let mut signatures = HashSet::with_capacity(rows.len());
        for row in &rows {
            let stage_name: String = row.try_get("stage_name")?;
            let observed_date: NaiveDate = row.try_get("observed_date")?;
            signatures.insert(stage_signature(bill_id, &stage_name, observed_date));
        }
        Ok(signatures)
    }

    async fn insert_members(&self, members: &[MemberRef]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for member in members {
            let result = sqlx::query(
                "INSERT INTO members (member_id, name) VALUES ($1, $2) \
                 ON CONFLICT (member_id) DO NOTHING",
            )
            .bind(member.id.0)
            .bind(&member.name)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn insert_roles(&self, member: &MemberRef, roles: &[Role]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO members (member_id, name) VALUES ($1, $2) \
             ON CONFLICT (member_id) DO NOTHING",
        )
        .bind(member.id.0)
        .bind(&member.name)
        .execute(&mut *tx)
        .await?;
        for role in roles {
            sqlx::query(
                "INSERT INTO roles (member_id, role_kind, start_date, end_date, \
                    parliament_number, session_number, constituency_name, \
                    constituency_province, party, committee_name, \
                    affiliation_role_name, organization_name, office_role, \
                    election_result) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            )
            .bind(role.member_id.0)
            .bind(role.kind.as_str())
            .bind(role.start_date)
            .bind(role.end_date)
            .bind(role.parliament_number)
            .bind(role.session_number)
            .bind(&role.constituency_name)
            .bind(&role.constituency_province)
            .bind(&role.party)
            .bind(&role.committee_name)
            .bind(&role.affiliation_role_name)
            .bind(&role.organization_name)
            .bind(&role.office_role)
            .bind(&role.election_result)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_votes(&self, member: MemberId, votes: &[Vote]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for vote in votes {
            debug_assert_eq!(vote.member_id, member);
            sqlx::query(
                "INSERT INTO votes (member_id, parliament_number, session_number, \
                    vote_date, vote_topic, subject, vote_result, member_position) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(vote.member_id.0)
            .bind(vote.parliament_number)
            .bind(vote.session_number)
            .bind(vote.vote_date)
            .bind(&vote.vote_topic)
            .bind(&vote.subject)
            .bind(&vote.vote_result)
            .bind(vote.position.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_bills(&self, bills: &[Bill]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for bill in bills {
            sqlx::query(
                "INSERT INTO bills (bill_number, parliament_number, session_number, \
                    status, chamber, short_title, long_title, sponsor_name, sponsor_id) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(&bill.key.number)
            .bind(bill.key.parliament)
            .bind(bill.key.session)
            .bind(&bill.status)
            .bind(bill.chamber.as_str())
            .bind(&bill.short_title)
            .bind(&bill.long_title)
            .bind(&bill.sponsor_name)
            .bind(bill.sponsor_id.map(|id| id.0))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_stages(&self, bill_id: i64, stages: &[BillStage]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for stage in stages {
            debug_assert_eq!(stage.bill_id, bill_id);
            sqlx::query(
                "INSERT INTO bill_progress (bill_id, stage_name, stage_state, \
                    chamber, observed_date) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(stage.bill_id)
            .bind(&stage.stage_name)
            .bind(stage.state.as_str())
            .bind(stage.chamber.as_str())
            .bind(stage.observed_date)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn bills_missing_details(&self) -> Result<Vec<BillRef>, StoreError> {
        let rows = sqlx::query(
            "SELECT bill_id, bill_number, parliament_number, session_number \
             FROM bills \
             WHERE sponsor_name IS NULL OR bill_type IS NULL \
                OR introduction_date IS NULL OR summary IS NULL \
             ORDER BY bill_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(BillRef {
                    id: row.try_get("bill_id")?,
                    key: BillKey {
                        number: row.try_get("bill_number")?,
                        parliament: row.try_get("parliament_number")?,
                        session: row.try_get("session_number")?,
                    },
                })
            })
            .collect()
    }

    async fn fill_bill_details(
        &self,
        bill_id: i64,
        details: &BillDetails,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE bills SET \
                sponsor_name = COALESCE(sponsor_name, $2), \
                bill_type = COALESCE(bill_type, $3), \
                introduction_date = COALESCE(introduction_date, $4), \
                summary = COALESCE(summary, $5) \
             WHERE bill_id = $1 \
               AND ((sponsor_name IS NULL AND $2 IS NOT NULL) \
                 OR (bill_type IS NULL AND $3 IS NOT NULL) \
                 OR (introduction_date IS NULL AND $4 IS NOT NULL) \
                 OR (summary IS NULL AND $5 IS NOT NULL))",
        )
        .bind(bill_id)
        .bind(&details.sponsor_name)
        .bind(&details.bill_type)
        .bind(details.introduction_date)
        .bind(&details.summary)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// In-memory store fake
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MemBill {
    id: i64,
    bill: Bill,
    bill_type: Option<String>,
    introduction_date: Option<NaiveDate>,
    summary: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    members: BTreeMap<i64, String>,
    roles: Vec<Role>,
    votes: Vec<Vote>,
    bills: Vec<MemBill>,
    stages: Vec<BillStage>,
    next_bill_id: i64,
}

/// In-memory store fake mirroring the relational schema's constraints:
/// foreign keys surface as `Constraint` errors, bill natural keys are unique.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub async fn seed_member(&self, id: i64, name: &str) {
        self.inner
            .lock()
            .await
            .members
            .insert(id, name.to_string());
    }

    pub async fn seed_bill(&self, bill: Bill) -> i64 {
        let mut inner = self.inner.lock().await;
        inner.next_bill_id += 1;
        let id = inner.next_bill_id;
        inner.bills.push(MemBill {
            id,
            bill,
            bill_type: None,
            introduction_date: None,
            summary: None,
        });
        id
    }

    pub async fn role_count(&self) -> usize {
        self.inner.lock().await.roles.len()
    }

    pub async fn vote_count(&self) -> usize {
        self.inner.lock().await.votes.len()
    }

    pub async fn bill_count(&self) -> usize {
        self.inner.lock().await.bills.len()
    }

    pub async fn stage_count(&self) -> usize {
        self.inner.lock().await.stages.len()
    }

    pub async fn votes_for(&self, member: MemberId) -> Vec<Vote> {
        self.inner
            .lock()
            .await
            .votes
            .iter()
            .filter(|v| v.member_id == member)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn fetchable_members(&self) -> Result<Vec<MemberRef>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .members
            .iter()
            .filter(|(id, _)| **id < SYNTHESIZED_MEMBER_ID_START)
            .map(|(id, name)| MemberRef {
                id: MemberId(*id),
                name: name.clone(),
            })
            .collect())
    }

    async fn all_bills(&self) -> Result<Vec<BillRef>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .bills
            .iter()
            .map(|b| BillRef {
                id: b.id,
                key: b.bill.key.clone(),
            })
            .collect())
    }

    async fn role_signatures(&self, member: MemberId) -> Result<HashSet<Signature>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .roles
            .iter()
            .filter(|r| r.member_id == member)
            .map(parly_core::DedupeSignature::signature)
            .collect())
    }

    async fn vote_signatures(&self, member: MemberId) -> Result<HashSet<Signature>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .votes
            .iter()
            .filter(|v| v.member_id == member)
            .map(parly_core::DedupeSignature::signature)
            .collect())
    }

    async fn bill_signatures(
        &self,
        parliament: i32,
        session: i32,
    ) -> Result<HashSet<Signature>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .bills
            .iter()
            .filter(|b| b.bill.key.parliament == parliament && b.bill.key.session == session)
            .map(|b| bill_signature(&b.bill.key))
            .collect())
    }

    async fn stage_signatures(&self, bill_id: i64) -> Result<HashSet<Signature>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .stages
            .iter()
            .filter(|s| s.bill_id == bill_id)
            .map(parly_core::DedupeSignature::signature)
            .collect())
    }

    async fn insert_members(&self, members: &[MemberRef]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut inserted = 0u64;
        for member in members {
            if !inner.members.contains_key(&member.id.0) {
                inner.members.insert(member.id.0, member.name.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn insert_roles(&self, member: &MemberRef, roles: &[Role]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .members
            .entry(member.id.0)
            .or_insert_with(|| member.name.clone());
        inner.roles.extend_from_slice(roles);
        Ok(())
    }

    async fn insert_votes(&self, member: MemberId, votes: &[Vote]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.members.contains_key(&member.0) {
            return Err(StoreError::Constraint(format!(
                "votes reference missing member {member}"
            )));
        }
        inner.votes.extend_from_slice(votes);
        Ok(())
    }

    async fn insert_bills(&self, bills: &[Bill]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for bill in bills {
            if inner.bills.iter().any(|b| b.bill.key == bill.key) {
                return Err(StoreError::Constraint(format!(
                    "duplicate bill {}",
                    bill.key
                )));
            }
            inner.next_bill_id += 1;
            let id = inner.next_bill_id;
            inner.bills.push(MemBill {
                id,
                bill: bill.clone(),
                bill_type: None,
                introduction_date: None,
                summary: None,
            });
        }
        Ok(())
    }

    async fn insert_stages(&self, bill_id: i64, stages: &[BillStage]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.bills.iter().any(|b| b.id == bill_id) {
            return Err(StoreError::Constraint(format!(
                "stages reference missing bill {bill_id}"
            )));
        }
        inner.stages.extend_from_slice(stages);
        Ok(())
    }

    async fn bills_missing_details(&self) -> Result<Vec<BillRef>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .bills
            .iter()
            .filter(|b| {
                b.bill.sponsor_name.is_none()
                    || b.bill_type.is_none()
                    || b.introduction_date.is_none()
                    || b.summary.is_none()
            })
            .map(|b| BillRef {
                id: b.id,
                key: b.bill.key.clone(),
            })
            .collect())
    }

    async fn fill_bill_details(
        &self,
        bill_id: i64,
        details: &BillDetails,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let bill = inner
            .bills
            .iter_mut()
            .find(|b| b.id == bill_id)
            .ok_or_else(|| StoreError::Constraint(format!("missing bill {bill_id}")))?;
        let mut changed = false;
        if bill.bill.sponsor_name.is_none() && details.sponsor_name.is_some() {
            bill.bill.sponsor_name = details.sponsor_name.clone();
            changed = true;
        }
        if bill.bill_type.is_none() && details.bill_type.is_some() {
            bill.bill_type = details.bill_type.clone();
            changed = true;
        }
        if bill.introduction_date.is_none() && details.introduction_date.is_some() {
            bill.introduction_date = details.introduction_date;
            changed = true;
        }
        if bill.summary.is_none() && details.summary.is_some() {
            bill.summary = details.summary.clone();
            changed = true;
        }
        Ok(changed)
    }
}
