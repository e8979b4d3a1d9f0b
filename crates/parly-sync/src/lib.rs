//! The incremental sync engine: entity jobs, the owner-by-owner run loop
//! with checkpoint resume, the member directory seeder, and the concurrent
//! bill detail backfill.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parly_adapters::{
    bill_json_url, bill_progress_url, member_roles_url, member_votes_url,
    parse_bill_details_json, parse_bills_xml, parse_member_directory_html, parse_progress_json,
    parse_roles_xml, parse_votes_xml, session_bills_url, Parsed, MEMBER_DIRECTORY_URL,
};
use parly_core::{Bill, BillRef, BillStage, DedupeSignature, MemberRef, Role, Signature, Vote};
use parly_storage::{
    BackoffPolicy, CheckpointStore, FetchError, HttpClientConfig, HttpFetcher, Store, StoreError,
    DEFAULT_USER_AGENT,
};

/// Every parliament session the bills listing endpoint covers, oldest first.
pub const PARLIAMENT_SESSIONS: &[(i32, i32)] = &[
    (35, 1),
    (35, 2),
    (36, 1),
    (36, 2),
    (37, 1),
    (37, 2),
    (37, 3),
    (38, 1),
    (39, 1),
    (39, 2),
    (40, 1),
    (40, 2),
    (40, 3),
    (41, 1),
    (41, 2),
    (42, 1),
    (43, 1),
    (43, 2),
    (44, 1),
    (45, 1),
];

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub user_agent: String,
    pub http_timeout: Duration,
    pub min_request_interval: Duration,
    pub checkpoint_dir: PathBuf,
    pub max_retries: usize,
    pub backfill_workers: usize,
}

impl SyncConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?,
            user_agent: env_or("PARLY_USER_AGENT", DEFAULT_USER_AGENT),
            http_timeout: Duration::from_secs(env_parsed("PARLY_HTTP_TIMEOUT_SECS", 10)?),
            min_request_interval: Duration::from_millis(env_parsed("PARLY_RATE_LIMIT_MS", 1000)?),
            checkpoint_dir: PathBuf::from(env_or("PARLY_CHECKPOINT_DIR", "data")),
            max_retries: env_parsed("PARLY_MAX_RETRIES", 3)?,
            backfill_workers: env_parsed("PARLY_BACKFILL_WORKERS", 3)?,
        })
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: self.user_agent.clone(),
            min_request_interval: self.min_request_interval,
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..BackoffPolicy::default()
            },
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Roles,
    Votes,
    Bills,
    BillProgress,
}

impl EntityKind {
    /// Stable name used for checkpoint files and logs.
    pub fn job_name(self) -> &'static str {
        match self {
            EntityKind::Roles => "roles",
            EntityKind::Votes => "votes",
            EntityKind::Bills => "bills",
            EntityKind::BillProgress => "bill_progress",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.job_name())
    }
}

/// Fetching is behind a trait so the run loop can be driven by scripted
/// payloads in tests.
#[async_trait]
pub trait PayloadFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

#[async_trait]
impl PayloadFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        HttpFetcher::fetch(self, url).await
    }
}

/// Keeps only records whose signature is not yet in `seen`, inserting as it
/// goes. Catches both records already in the store and duplicates within the
/// same payload.
pub fn filter_new<R: DedupeSignature>(records: Vec<R>, seen: &mut HashSet<Signature>) -> Vec<R> {
    records
        .into_iter()
        .filter(|record| seen.insert(record.signature()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Fetch,
    Persist,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncPhase::Fetch => "fetch",
            SyncPhase::Persist => "persist",
        })
    }
}

#[derive(Debug, Clone)]
pub struct OwnerFailure {
    pub owner: String,
    pub phase: SyncPhase,
    pub reason: String,
}

/// Statistics for one run of one entity job.
#[derive(Debug)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub entity: EntityKind,
    pub owners_attempted: usize,
    pub owners_committed: usize,
    pub records_parsed: usize,
    pub records_inserted: usize,
    pub records_skipped: usize,
    pub warnings: usize,
    pub failures: Vec<OwnerFailure>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl RunSummary {
    fn new(run_id: Uuid, entity: EntityKind) -> Self {
        Self {
            run_id,
            entity,
            owners_attempted: 0,
            owners_committed: 0,
            records_parsed: 0,
            records_inserted: 0,
            records_skipped: 0,
            warnings: 0,
            failures: Vec::new(),
            cancelled: false,
            elapsed: Duration::ZERO,
        }
    }

    pub fn owners_failed(&self) -> usize {
        self.failures.len()
    }

    fn fail(&mut self, owner: String, phase: SyncPhase, reason: String) {
        self.failures.push(OwnerFailure {
            owner,
            phase,
            reason,
        });
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run {} ({})", self.run_id, self.entity)?;
        writeln!(
            f,
            "  owners: {} attempted, {} committed, {} failed",
            self.owners_attempted,
            self.owners_committed,
            self.owners_failed()
        )?;
        writeln!(
            f,
            "  records: {} parsed, {} inserted, {} skipped as duplicates",
            self.records_parsed, self.records_inserted, self.records_skipped
        )?;
        writeln!(f, "  parse warnings: {}", self.warnings)?;
        for failure in &self.failures {
            writeln!(
                f,
                "  failed owner {} ({}): {}",
                failure.owner, failure.phase, failure.reason
            )?;
        }
        write!(
            f,
            "  elapsed: {:.1}s{}",
            self.elapsed.as_secs_f64(),
            if self.cancelled { " (cancelled)" } else { "" }
        )
    }
}

/// Cooperative cancellation shared between the run loop and a signal handler.
/// The current owner always finishes before the loop stops.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One synchronized entity: how to enumerate its owners, where to fetch each
/// owner's payload, how to parse it, and how to read and write the store.
#[async_trait]
pub trait EntityJob: Send + Sync {
    type Owner: Send + Sync;
    type Record: DedupeSignature + Send + Sync;

    fn entity(&self) -> EntityKind;

    async fn owners(&self, store: &dyn Store) -> Result<Vec<Self::Owner>, StoreError>;

    fn owner_key(&self, owner: &Self::Owner) -> String;

    /// `None` when no source URL can be built for the owner, which fails the
    /// owner without a request.
    fn url(&self, owner: &Self::Owner) -> Option<String>;

    fn parse(&self, payload: &[u8], owner: &Self::Owner) -> Parsed<Self::Record>;

    async fn existing(
        &self,
        store: &dyn Store,
        owner: &Self::Owner,
    ) -> Result<HashSet<Signature>, StoreError>;

    async fn persist(
        &self,
        store: &dyn Store,
        owner: &Self::Owner,
        fresh: Vec<Self::Record>,
    ) -> Result<(), StoreError>;
}

pub struct SyncEngine<'a> {
    pub store: &'a dyn Store,
    pub fetcher: &'a dyn PayloadFetcher,
    pub checkpoints: &'a dyn CheckpointStore,
    pub cancel: CancelFlag,
}

impl SyncEngine<'_> {
    /// Runs one entity job over every owner past the checkpoint. Each owner
    /// is fetched, parsed, diffed against the store, and committed in its own
    /// transaction; the checkpoint advances only after the commit. A failed
    /// owner is recorded and skipped. The checkpoint is cleared only when the
    /// loop reaches the end of the owner list, so an interrupted run resumes
    /// where it stopped and a finished run starts over from the top.
    pub async fn run<J: EntityJob>(&self, job: &J) -> anyhow::Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let entity = job.entity();
        let started = std::time::Instant::now();
        let mut summary = RunSummary::new(run_id, entity);

        let owners = job
            .owners(self.store)
            .await
            .with_context(|| format!("listing owners for {entity}"))?;

        let start_index = match self.checkpoints.load()? {
            Some(checkpoint) => {
                let position = owners
                    .iter()
                    .position(|owner| job.owner_key(owner) == checkpoint.owner_key);
                match position {
                    Some(index) => {
                        info!(%entity, owner = %checkpoint.owner_key, "resuming after checkpoint");
                        index + 1
                    }
                    None => {
                        warn!(%entity, owner = %checkpoint.owner_key,
                              "checkpointed owner no longer listed, starting over");
                        0
                    }
                }
            }
            None => 0,
        };

        info!(%run_id, %entity, owners = owners.len(), start_index, "sync run starting");

        let mut reached_end = true;
        for owner in &owners[start_index..] {
            if self.cancel.is_cancelled() {
                info!(%entity, "cancellation requested, stopping before next owner");
                summary.cancelled = true;
                reached_end = false;
                break;
            }

            let key = job.owner_key(owner);
            summary.owners_attempted += 1;

            let Some(url) = job.url(owner) else {
                warn!(%entity, owner = %key, "no source url for owner");
                summary.fail(key, SyncPhase::Fetch, "no source url".to_string());
                continue;
            };

            let payload = match self.fetcher.fetch(&url).await {
                Ok(payload) => payload,
                Err(err) => {
                    summary.fail(key, SyncPhase::Fetch, err.to_string());
                    continue;
                }
            };

            let parsed = job.parse(&payload, owner);
            summary.records_parsed += parsed.records.len();
            summary.warnings += parsed.warnings.len();
            for warning in &parsed.warnings {
                warn!(%entity, owner = %key, message = %warning.message, "parse warning");
            }

            let mut seen = match job.existing(self.store, owner).await {
                Ok(seen) => seen,
                Err(err) => {
                    summary.fail(key, SyncPhase::Persist, err.to_string());
                    continue;
                }
            };

            let candidates = parsed.records.len();
            let fresh = filter_new(parsed.records, &mut seen);
            summary.records_skipped += candidates - fresh.len();

            let fresh_count = fresh.len();
            if fresh_count > 0 {
                if let Err(err) = job.persist(self.store, owner, fresh).await {
                    match &err {
                        StoreError::Constraint(reason) => {
                            error!(%entity, owner = %key, %reason, "constraint violation on insert")
                        }
                        StoreError::Io(reason) => {
                            warn!(%entity, owner = %key, %reason, "insert failed")
                        }
                    }
                    summary.fail(key, SyncPhase::Persist, err.to_string());
                    continue;
                }
            }

            summary.records_inserted += fresh_count;
            self.checkpoints
                .save(&key)
                .with_context(|| format!("saving checkpoint for {entity}"))?;
            summary.owners_committed += 1;
            debug!(%entity, owner = %key, inserted = fresh_count, "owner committed");
        }

        if reached_end {
            self.checkpoints
                .clear()
                .with_context(|| format!("clearing checkpoint for {entity}"))?;
        }

        summary.elapsed = started.elapsed();
        info!(%run_id, %entity, committed = summary.owners_committed,
              failed = summary.owners_failed(), inserted = summary.records_inserted,
              "sync run finished");
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Entity jobs
// ---------------------------------------------------------------------------

/// Member role history, one owner per fetchable member.
#[derive(Debug, Default)]
pub struct RolesJob;

#[async_trait]
impl EntityJob for RolesJob {
    type Owner = MemberRef;
    type Record = Role;

    fn entity(&self) -> EntityKind {
        EntityKind::Roles
    }

    async fn owners(&self, store: &dyn Store) -> Result<Vec<MemberRef>, StoreError> {
        store.fetchable_members().await
    }

    fn owner_key(&self, owner: &MemberRef) -> String {
        owner.id.to_string()
    }

    fn url(&self, owner: &MemberRef) -> Option<String> {
        Some(member_roles_url(owner))
    }

    fn parse(&self, payload: &[u8], owner: &MemberRef) -> Parsed<Role> {
        parse_roles_xml(payload, owner.id)
    }

    async fn existing(
        &self,
        store: &dyn Store,
        owner: &MemberRef,
    ) -> Result<HashSet<Signature>, StoreError> {
        store.role_signatures(owner.id).await
    }

    async fn persist(
        &self,
        store: &dyn Store,
        owner: &MemberRef,
        fresh: Vec<Role>,
    ) -> Result<(), StoreError> {
        store.insert_roles(owner, &fresh).await
    }
}

/// Member voting records, one owner per fetchable member.
#[derive(Debug, Default)]
pub struct VotesJob;

#[async_trait]
impl EntityJob for VotesJob {
    type Owner = MemberRef;
    type Record = Vote;

    fn entity(&self) -> EntityKind {
        EntityKind::Votes
    }

    async fn owners(&self, store: &dyn Store) -> Result<Vec<MemberRef>, StoreError> {
        store.fetchable_members().await
    }

    fn owner_key(&self, owner: &MemberRef) -> String {
        owner.id.to_string()
    }

    fn url(&self, owner: &MemberRef) -> Option<String> {
        Some(member_votes_url(owner))
    }

    fn parse(&self, payload: &[u8], owner: &MemberRef) -> Parsed<Vote> {
        parse_votes_xml(payload, owner.id)
    }

    async fn existing(
        &self,
        store: &dyn Store,
        owner: &MemberRef,
    ) -> Result<HashSet<Signature>, StoreError> {
        store.vote_signatures(owner.id).await
    }

    async fn persist(
        &self,
        store: &dyn Store,
        owner: &MemberRef,
        fresh: Vec<Vote>,
    ) -> Result<(), StoreError> {
        store.insert_votes(owner.id, &fresh).await
    }
}

/// Bill listings, one owner per parliament session.
#[derive(Debug)]
pub struct BillsJob {
    pub sessions: Vec<(i32, i32)>,
}

impl Default for BillsJob {
    fn default() -> Self {
        Self {
            sessions: PARLIAMENT_SESSIONS.to_vec(),
        }
    }
}

#[async_trait]
impl EntityJob for BillsJob {
    type Owner = (i32, i32);
    type Record = Bill;

    fn entity(&self) -> EntityKind {
        EntityKind::Bills
    }

    async fn owners(&self, _store: &dyn Store) -> Result<Vec<(i32, i32)>, StoreError> {
        Ok(self.sessions.clone())
    }

    fn owner_key(&self, owner: &(i32, i32)) -> String {
        format!("{}-{}", owner.0, owner.1)
    }

    fn url(&self, owner: &(i32, i32)) -> Option<String> {
        Some(session_bills_url(owner.0, owner.1))
    }

    fn parse(&self, payload: &[u8], _owner: &(i32, i32)) -> Parsed<Bill> {
        parse_bills_xml(payload)
    }

    async fn existing(
        &self,
        store: &dyn Store,
        owner: &(i32, i32),
    ) -> Result<HashSet<Signature>, StoreError> {
        store.bill_signatures(owner.0, owner.1).await
    }

    async fn persist(
        &self,
        store: &dyn Store,
        _owner: &(i32, i32),
        fresh: Vec<Bill>,
    ) -> Result<(), StoreError> {
        store.insert_bills(&fresh).await
    }
}

/// Bill stage history, one owner per stored bill.
#[derive(Debug, Default)]
pub struct BillProgressJob;

#[async_trait]
impl EntityJob for BillProgressJob {
    type Owner = BillRef;
    type Record = BillStage;

    fn entity(&self) -> EntityKind {
        EntityKind::BillProgress
    }

    async fn owners(&self, store: &dyn Store) -> Result<Vec<BillRef>, StoreError> {
        store.all_bills().await
    }

    fn owner_key(&self, owner: &BillRef) -> String {
        owner.id.to_string()
    }

    fn url(&self, owner: &BillRef) -> Option<String> {
        bill_progress_url(&owner.key)
    }

    fn parse(&self, payload: &[u8], owner: &BillRef) -> Parsed<BillStage> {
        parse_progress_json(payload, owner.id)
    }

    async fn existing(
        &self,
        store: &dyn Store,
        owner: &BillRef,
    ) -> Result<HashSet<Signature>, StoreError> {
        store.stage_signatures(owner.id).await
    }

    async fn persist(
        &self,
        store: &dyn Store,
        owner: &BillRef,
        fresh: Vec<BillStage>,
    ) -> Result<(), StoreError> {
        store.insert_stages(owner.id, &fresh).await
    }
}

// ---------------------------------------------------------------------------
// Member seeding and bill detail backfill
// ---------------------------------------------------------------------------

/// Scrapes the member directory listing and insert-ignores every member
/// found. One request; returns (newly inserted, total listed).
pub async fn seed_members(
    store: &dyn Store,
    fetcher: &dyn PayloadFetcher,
) -> anyhow::Result<(u64, usize)> {
    let payload = fetcher
        .fetch(MEMBER_DIRECTORY_URL)
        .await
        .context("fetching member directory")?;
    let parsed = parse_member_directory_html(&payload);
    for warning in &parsed.warnings {
        warn!(message = %warning.message, "directory parse warning");
    }
    let total = parsed.records.len();
    let inserted = store
        .insert_members(&parsed.records)
        .await
        .context("inserting members")?;
    info!(total, inserted, "member directory seeded");
    Ok((inserted, total))
}

#[derive(Debug, Default)]
pub struct BackfillSummary {
    pub bills_scanned: usize,
    pub bills_updated: usize,
    pub failures: usize,
}

impl BackfillSummary {
    fn absorb(&mut self, other: BackfillSummary) {
        self.bills_scanned += other.bills_scanned;
        self.bills_updated += other.bills_updated;
        self.failures += other.failures;
    }
}

impl fmt::Display for BackfillSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "backfill: {} bills scanned, {} updated, {} failures",
            self.bills_scanned, self.bills_updated, self.failures
        )
    }
}

/// Fills NULL enrichment columns of bills from their detail JSON, spread
/// across `workers` concurrent tasks over disjoint slices of the worklist.
/// Request pacing is whatever the shared fetcher enforces, so concurrency
/// never multiplies the request rate.
pub async fn backfill_bill_details(
    store: Arc<dyn Store>,
    fetcher: Arc<dyn PayloadFetcher>,
    workers: usize,
    cancel: CancelFlag,
) -> anyhow::Result<BackfillSummary> {
    let bills = store
        .bills_missing_details()
        .await
        .context("listing bills missing details")?;
    info!(bills = bills.len(), workers, "bill detail backfill starting");

    let chunk_size = bills.len().div_ceil(workers.max(1)).max(1);
    let mut tasks = JoinSet::new();
    for chunk in bills.chunks(chunk_size) {
        let chunk = chunk.to_vec();
        let store = Arc::clone(&store);
        let fetcher = Arc::clone(&fetcher);
        let cancel = cancel.clone();
        tasks.spawn(async move { backfill_chunk(chunk, store, fetcher, cancel).await });
    }

    let mut summary = BackfillSummary::default();
    while let Some(result) = tasks.join_next().await {
        summary.absorb(result.context("backfill worker panicked")?);
    }
    info!(scanned = summary.bills_scanned, updated = summary.bills_updated,
          failures = summary.failures, "bill detail backfill finished");
    Ok(summary)
}

async fn backfill_chunk(
    bills: Vec<BillRef>,
    store: Arc<dyn Store>,
    fetcher: Arc<dyn PayloadFetcher>,
    cancel: CancelFlag,
) -> BackfillSummary {
    let mut summary = BackfillSummary::default();
    for bill in bills {
        if cancel.is_cancelled() {
            break;
        }
        summary.bills_scanned += 1;

        let Some(url) = bill_json_url(&bill.key) else {
            debug!(bill = %bill.key, "no detail url for bill");
            summary.failures += 1;
            continue;
        };
        let payload = match fetcher.fetch(&url).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(bill = %bill.key, error = %err, "detail fetch failed");
                summary.failures += 1;
                continue;
            }
        };
        let details = match parse_bill_details_json(&payload) {
            Ok(details) => details,
            Err(err) => {
                warn!(bill = %bill.key, error = %err, "unparseable detail payload");
                summary.failures += 1;
                continue;
            }
        };
        if details.is_empty() {
            continue;
        }
        match store.fill_bill_details(bill.id, &details).await {
            Ok(true) => summary.bills_updated += 1,
            Ok(false) => {}
            Err(err) => {
                warn!(bill = %bill.key, error = %err, "detail update failed");
                summary.failures += 1;
            }
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use parly_core::{BillKey, Chamber, MemberId, VotePosition};
    use parly_storage::{MemoryCheckpointStore, MemoryStore};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Fetcher serving scripted responses per URL, in order. An unknown URL
    /// or an exhausted queue answers 404.
    #[derive(Default)]
    struct ScriptedFetcher {
        responses: Mutex<HashMap<String, VecDeque<Result<Vec<u8>, u16>>>>,
    }

    impl ScriptedFetcher {
        fn ok(&self, url: &str, body: impl Into<Vec<u8>>) {
            self.responses
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push_back(Ok(body.into()));
        }

        fn fail(&self, url: &str, status: u16) {
            self.responses
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push_back(Err(status));
        }
    }

    #[async_trait]
    impl PayloadFetcher for ScriptedFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            let scripted = self
                .responses
                .lock()
                .unwrap()
                .get_mut(url)
                .and_then(VecDeque::pop_front);
            match scripted {
                Some(Ok(body)) => Ok(body),
                Some(Err(status)) => Err(FetchError::HttpStatus {
                    status,
                    url: url.to_string(),
                }),
                None => Err(FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }
    }

    fn vote_fragment(day: u32, subject: &str) -> String {
        format!(
            "<MemberVote>\
             <ParliamentNumber>44</ParliamentNumber>\
             <SessionNumber>1</SessionNumber>\
             <DecisionEventDateTime>2022-03-{day:02}T19:30:00</DecisionEventDateTime>\
             <DecisionDivisionSubject>{subject}</DecisionDivisionSubject>\
             <DecisionResultName>Agreed To</DecisionResultName>\
             <VoteValueName>Yea</VoteValueName>\
             </MemberVote>"
        )
    }

    fn votes_xml(fragments: &[String]) -> String {
        format!("<ArrayOfMemberVote>{}</ArrayOfMemberVote>", fragments.join(""))
    }

    fn member(id: i64, name: &str) -> MemberRef {
        MemberRef {
            id: MemberId(id),
            name: name.to_string(),
        }
    }

    fn engine<'a>(
        store: &'a MemoryStore,
        fetcher: &'a ScriptedFetcher,
        checkpoints: &'a MemoryCheckpointStore,
    ) -> SyncEngine<'a> {
        SyncEngine {
            store,
            fetcher,
            checkpoints,
            cancel: CancelFlag::default(),
        }
    }

    #[tokio::test]
    async fn fresh_owner_inserts_all_parsed_votes() {
        let store = MemoryStore::default();
        store.seed_member(25645, "Justin Trudeau").await;

        let fetcher = ScriptedFetcher::default();
        let url = member_votes_url(&member(25645, "Justin Trudeau"));
        let xml = votes_xml(&[
            vote_fragment(15, "Budget Implementation Act"),
            vote_fragment(16, "Opposition Motion"),
            vote_fragment(17, "Third Reading of Bill C-8"),
        ]);
        fetcher.ok(&url, xml.as_bytes().to_vec());

        let checkpoints = MemoryCheckpointStore::default();
        let summary = engine(&store, &fetcher, &checkpoints)
            .run(&VotesJob)
            .await
            .unwrap();

        assert_eq!(summary.owners_attempted, 1);
        assert_eq!(summary.owners_committed, 1);
        assert_eq!(summary.owners_failed(), 0);
        assert_eq!(summary.records_parsed, 3);
        assert_eq!(summary.records_inserted, 3);
        assert_eq!(summary.records_skipped, 0);
        assert_eq!(store.vote_count().await, 3);

        // Checkpoint advanced through the owner, then cleared at end of list.
        assert_eq!(checkpoints.saved_keys(), vec!["25645".to_string()]);
        assert!(checkpoints.current().is_none());
    }

    #[tokio::test]
    async fn second_run_inserts_only_new_votes() {
        let store = MemoryStore::default();
        store.seed_member(25645, "Justin Trudeau").await;

        let fetcher = ScriptedFetcher::default();
        let url = member_votes_url(&member(25645, "Justin Trudeau"));
        let two = votes_xml(&[
            vote_fragment(15, "Budget Implementation Act"),
            vote_fragment(16, "Opposition Motion"),
        ]);
        let three = votes_xml(&[
            vote_fragment(15, "Budget Implementation Act"),
            vote_fragment(16, "Opposition Motion"),
            vote_fragment(17, "Third Reading of Bill C-8"),
        ]);
        fetcher.ok(&url, two.as_bytes().to_vec());
        fetcher.ok(&url, three.as_bytes().to_vec());

        let checkpoints = MemoryCheckpointStore::default();
        let engine = engine(&store, &fetcher, &checkpoints);

        let first = engine.run(&VotesJob).await.unwrap();
        assert_eq!(first.records_inserted, 2);

        let second = engine.run(&VotesJob).await.unwrap();
        assert_eq!(second.records_parsed, 3);
        assert_eq!(second.records_inserted, 1);
        assert_eq!(second.records_skipped, 2);
        assert_eq!(store.vote_count().await, 3);
    }

    #[tokio::test]
    async fn duplicate_votes_within_one_payload_insert_once() {
        let store = MemoryStore::default();
        store.seed_member(25645, "Justin Trudeau").await;

        let fetcher = ScriptedFetcher::default();
        let url = member_votes_url(&member(25645, "Justin Trudeau"));
        let xml = votes_xml(&[
            vote_fragment(15, "Budget Implementation Act"),
            vote_fragment(15, "Budget Implementation Act"),
        ]);
        fetcher.ok(&url, xml.as_bytes().to_vec());

        let checkpoints = MemoryCheckpointStore::default();
        let summary = engine(&store, &fetcher, &checkpoints)
            .run(&VotesJob)
            .await
            .unwrap();

        assert_eq!(summary.records_inserted, 1);
        assert_eq!(summary.records_skipped, 1);
        assert_eq!(store.vote_count().await, 1);
    }

    #[tokio::test]
    async fn failed_owner_is_recorded_and_rest_commit() {
        let store = MemoryStore::default();
        store.seed_member(25645, "Justin Trudeau").await;
        store.seed_member(89156, "Ziad Aboultaif").await;

        let fetcher = ScriptedFetcher::default();
        fetcher.fail(&member_votes_url(&member(25645, "Justin Trudeau")), 500);
        let xml = votes_xml(&[vote_fragment(15, "Budget Implementation Act")]);
        fetcher.ok(
            &member_votes_url(&member(89156, "Ziad Aboultaif")),
            xml.as_bytes().to_vec(),
        );

        let checkpoints = MemoryCheckpointStore::default();
        let summary = engine(&store, &fetcher, &checkpoints)
            .run(&VotesJob)
            .await
            .unwrap();

        assert_eq!(summary.owners_attempted, 2);
        assert_eq!(summary.owners_committed, 1);
        assert_eq!(summary.owners_failed(), 1);
        assert_eq!(summary.failures[0].owner, "25645");
        assert_eq!(summary.failures[0].phase, SyncPhase::Fetch);
        assert_eq!(store.vote_count().await, 1);

        // Only the committed owner advanced the checkpoint.
        assert_eq!(checkpoints.saved_keys(), vec!["89156".to_string()]);
    }

    #[tokio::test]
    async fn run_resumes_after_checkpointed_owner() {
        let store = MemoryStore::default();
        store.seed_member(25645, "Justin Trudeau").await;
        store.seed_member(89156, "Ziad Aboultaif").await;

        // Only the second member's payload is scripted; touching the first
        // member's URL would answer 404 and fail the owner.
        let fetcher = ScriptedFetcher::default();
        let xml = votes_xml(&[vote_fragment(15, "Budget Implementation Act")]);
        fetcher.ok(
            &member_votes_url(&member(89156, "Ziad Aboultaif")),
            xml.as_bytes().to_vec(),
        );

        let checkpoints = MemoryCheckpointStore::with_checkpoint("25645");
        let summary = engine(&store, &fetcher, &checkpoints)
            .run(&VotesJob)
            .await
            .unwrap();

        assert_eq!(summary.owners_attempted, 1);
        assert_eq!(summary.owners_committed, 1);
        assert_eq!(summary.owners_failed(), 0);
    }

    #[tokio::test]
    async fn cancellation_stops_between_owners_and_keeps_checkpoint() {
        let store = MemoryStore::default();
        store.seed_member(25645, "Justin Trudeau").await;
        store.seed_member(89156, "Ziad Aboultaif").await;

        let fetcher = ScriptedFetcher::default();
        let checkpoints = MemoryCheckpointStore::with_checkpoint("25645");
        let engine = engine(&store, &fetcher, &checkpoints);
        engine.cancel.cancel();

        let summary = engine.run(&VotesJob).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.owners_attempted, 0);
        // A cancelled run keeps the checkpoint so the next run resumes.
        assert_eq!(checkpoints.current().unwrap().owner_key, "25645");
    }

    /// Store whose first vote insert for one member fails as if the database
    /// connection dropped, cancelling the run the way a fatal condition would.
    struct CrashingStore {
        inner: MemoryStore,
        fail_member: MemberId,
        armed: Mutex<bool>,
        cancel: CancelFlag,
    }

    #[async_trait]
    impl Store for CrashingStore {
        async fn fetchable_members(&self) -> Result<Vec<MemberRef>, StoreError> {
            self.inner.fetchable_members().await
        }

        async fn all_bills(&self) -> Result<Vec<BillRef>, StoreError> {
            self.inner.all_bills().await
        }

        async fn role_signatures(
            &self,
            member: MemberId,
        ) -> Result<HashSet<Signature>, StoreError> {
            self.inner.role_signatures(member).await
        }

        async fn vote_signatures(
            &self,
            member: MemberId,
        ) -> Result<HashSet<Signature>, StoreError> {
            self.inner.vote_signatures(member).await
        }

        async fn bill_signatures(
            &self,
            parliament: i32,
            session: i32,
        ) -> Result<HashSet<Signature>, StoreError> {
            self.inner.bill_signatures(parliament, session).await
        }

        async fn stage_signatures(&self, bill_id: i64) -> Result<HashSet<Signature>, StoreError> {
            self.inner.stage_signatures(bill_id).await
        }

        async fn insert_members(&self, members: &[MemberRef]) -> Result<u64, StoreError> {
            self.inner.insert_members(members).await
        }

        async fn insert_roles(
            &self,
            member: &MemberRef,
            roles: &[Role],
        ) -> Result<(), StoreError> {
            self.inner.insert_roles(member, roles).await
        }

        async fn insert_votes(
            &self,
            member: MemberId,
            votes: &[Vote],
        ) -> Result<(), StoreError> {
            // Guard scoped so it is released before the await below.
            let should_fail = {
                let mut armed = self.armed.lock().unwrap();
                if *armed && member == self.fail_member {
                    *armed = false;
                    true
                } else {
                    false
                }
            };
            if should_fail {
                self.cancel.cancel();
                return Err(StoreError::Io("connection lost".to_string()));
            }
            self.inner.insert_votes(member, votes).await
        }

        async fn insert_bills(&self, bills: &[Bill]) -> Result<(), StoreError> {
            self.inner.insert_bills(bills).await
        }

        async fn insert_stages(
            &self,
            bill_id: i64,
            stages: &[BillStage],
        ) -> Result<(), StoreError> {
            self.inner.insert_stages(bill_id, stages).await
        }

        async fn bills_missing_details(&self) -> Result<Vec<BillRef>, StoreError> {
            self.inner.bills_missing_details().await
        }

        async fn fill_bill_details(
            &self,
            bill_id: i64,
            details: &parly_core::BillDetails,
        ) -> Result<bool, StoreError> {
            self.inner.fill_bill_details(bill_id, details).await
        }
    }

    #[tokio::test]
    async fn persist_failure_keeps_checkpoint_behind_and_rerun_resumes_there() {
        let cancel = CancelFlag::default();
        let store = CrashingStore {
            inner: MemoryStore::default(),
            fail_member: MemberId(89156),
            armed: Mutex::new(true),
            cancel: cancel.clone(),
        };
        store.inner.seed_member(25645, "Justin Trudeau").await;
        store.inner.seed_member(89156, "Ziad Aboultaif").await;
        store.inner.seed_member(105340, "Scott Aitchison").await;

        let fetcher = ScriptedFetcher::default();
        let xml = |day| votes_xml(&[vote_fragment(day, "Budget Implementation Act")]);
        // Two runs' worth of payloads; the first run dies at the second owner.
        fetcher.ok(&member_votes_url(&member(25645, "Justin Trudeau")), xml(15).as_bytes().to_vec());
        fetcher.ok(&member_votes_url(&member(89156, "Ziad Aboultaif")), xml(16).as_bytes().to_vec());
        fetcher.ok(&member_votes_url(&member(89156, "Ziad Aboultaif")), xml(16).as_bytes().to_vec());
        fetcher.ok(&member_votes_url(&member(105340, "Scott Aitchison")), xml(17).as_bytes().to_vec());

        let checkpoints = MemoryCheckpointStore::default();
        let first = SyncEngine {
            store: &store,
            fetcher: &fetcher,
            checkpoints: &checkpoints,
            cancel,
        }
        .run(&VotesJob)
        .await
        .unwrap();

        assert_eq!(first.owners_committed, 1);
        assert_eq!(first.owners_failed(), 1);
        assert_eq!(first.failures[0].phase, SyncPhase::Persist);
        assert!(first.cancelled);
        // Checkpoint stayed behind the failed owner.
        assert_eq!(checkpoints.current().unwrap().owner_key, "25645");
        assert_eq!(store.inner.vote_count().await, 1);

        let second = SyncEngine {
            store: &store,
            fetcher: &fetcher,
            checkpoints: &checkpoints,
            cancel: CancelFlag::default(),
        }
        .run(&VotesJob)
        .await
        .unwrap();

        // Resumed at the failed owner and finished the list.
        assert_eq!(second.owners_attempted, 2);
        assert_eq!(second.owners_committed, 2);
        assert_eq!(store.inner.vote_count().await, 3);
        assert!(checkpoints.current().is_none());
    }

    #[tokio::test]
    async fn bill_without_detail_url_fails_without_a_request() {
        let store = MemoryStore::default();
        store.seed_bill(sample_bill("C215")).await;

        let fetcher = ScriptedFetcher::default();
        let checkpoints = MemoryCheckpointStore::default();
        let summary = engine(&store, &fetcher, &checkpoints)
            .run(&BillProgressJob)
            .await
            .unwrap();

        assert_eq!(summary.owners_failed(), 1);
        assert_eq!(summary.failures[0].reason, "no source url");
    }

    fn sample_bill(number: &str) -> Bill {
        Bill {
            key: BillKey::new(number, 44, 1),
            status: "Introduced".to_string(),
            chamber: Chamber::HouseOfCommons,
            short_title: None,
            long_title: None,
            sponsor_name: None,
            sponsor_id: None,
        }
    }

    #[tokio::test]
    async fn bills_job_iterates_sessions_and_dedupes() {
        let store = MemoryStore::default();
        let fetcher = ScriptedFetcher::default();

        let xml = r#"<Bills><Bill>
            <BillNumberFormatted>C-215</BillNumberFormatted>
            <ParliamentNumber>44</ParliamentNumber>
            <SessionNumber>1</SessionNumber>
            <OriginatingChamberId>1</OriginatingChamberId>
            </Bill></Bills>"#;
        fetcher.ok(&session_bills_url(44, 1), xml.as_bytes().to_vec());
        fetcher.ok(&session_bills_url(44, 1), xml.as_bytes().to_vec());

        let job = BillsJob {
            sessions: vec![(44, 1)],
        };
        let checkpoints = MemoryCheckpointStore::default();
        let engine = engine(&store, &fetcher, &checkpoints);

        let first = engine.run(&job).await.unwrap();
        assert_eq!(first.records_inserted, 1);
        assert_eq!(checkpoints.saved_keys(), vec!["44-1".to_string()]);

        let second = engine.run(&job).await.unwrap();
        assert_eq!(second.records_inserted, 0);
        assert_eq!(second.records_skipped, 1);
        assert_eq!(store.bill_count().await, 1);
    }

    #[tokio::test]
    async fn progress_job_appends_only_new_stages() {
        let store = MemoryStore::default();
        let bill_id = store.seed_bill(sample_bill("C-215")).await;

        let fetcher = ScriptedFetcher::default();
        let url = bill_progress_url(&BillKey::new("C-215", 44, 1)).unwrap();
        let one_stage = br#"{"BillStages": {"HouseBillStages": [
            {"BillStageName": "First reading", "StateAsOfDate": "2021-11-23", "State": 4}
        ]}}"#;
        let two_stages = br#"{"BillStages": {"HouseBillStages": [
            {"BillStageName": "First reading", "StateAsOfDate": "2021-11-23", "State": 4},
            {"BillStageName": "Second reading", "StateAsOfDate": "2022-02-09", "State": 4}
        ]}}"#;
        fetcher.ok(&url, one_stage.to_vec());
        fetcher.ok(&url, two_stages.to_vec());

        let checkpoints = MemoryCheckpointStore::default();
        let engine = engine(&store, &fetcher, &checkpoints);

        let first = engine.run(&BillProgressJob).await.unwrap();
        assert_eq!(first.records_inserted, 1);
        assert_eq!(checkpoints.saved_keys(), vec![bill_id.to_string()]);

        let second = engine.run(&BillProgressJob).await.unwrap();
        assert_eq!(second.records_inserted, 1);
        assert_eq!(second.records_skipped, 1);
        assert_eq!(store.stage_count().await, 2);
    }

    #[tokio::test]
    async fn seeding_members_is_idempotent() {
        let store = MemoryStore::default();
        let fetcher = ScriptedFetcher::default();
        let html = br#"<html><body>
            <a href="/members/en/ziad-aboultaif-89156">Ziad Aboultaif</a>
            <a href="/members/en/scott-aitchison-105340">Scott Aitchison</a>
            </body></html>"#;
        fetcher.ok(MEMBER_DIRECTORY_URL, html.to_vec());
        fetcher.ok(MEMBER_DIRECTORY_URL, html.to_vec());

        let (inserted, total) = seed_members(&store, &fetcher).await.unwrap();
        assert_eq!((inserted, total), (2, 2));

        let (inserted, total) = seed_members(&store, &fetcher).await.unwrap();
        assert_eq!((inserted, total), (0, 2));
    }

    #[tokio::test]
    async fn backfill_fills_missing_columns_across_workers() {
        let store = Arc::new(MemoryStore::default());
        let fetcher = Arc::new(ScriptedFetcher::default());

        for number in ["C-1", "C-2", "C-3"] {
            store.seed_bill(sample_bill(number)).await;
            let url = bill_json_url(&BillKey::new(number, 44, 1)).unwrap();
            fetcher.ok(
                &url,
                br#"{"SponsorPersonName": "Some Member", "IsGovernmentBill": true,
                    "LatestBillEventDateTime": "2022-02-02T00:00:00",
                    "ShortLegislativeSummaryEn": "Summary"}"#
                    .to_vec(),
            );
        }

        let summary = backfill_bill_details(
            store.clone() as Arc<dyn Store>,
            fetcher.clone() as Arc<dyn PayloadFetcher>,
            3,
            CancelFlag::default(),
        )
        .await
        .unwrap();

        assert_eq!(summary.bills_scanned, 3);
        assert_eq!(summary.bills_updated, 3);
        assert_eq!(summary.failures, 0);
        assert!(store.bills_missing_details().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn backfill_counts_unreachable_bills_as_failures() {
        let store = Arc::new(MemoryStore::default());
        let fetcher = Arc::new(ScriptedFetcher::default());
        store.seed_bill(sample_bill("C-1")).await;
        // No scripted response, so the fetch answers 404.

        let summary = backfill_bill_details(
            store.clone() as Arc<dyn Store>,
            fetcher.clone() as Arc<dyn PayloadFetcher>,
            2,
            CancelFlag::default(),
        )
        .await
        .unwrap();

        assert_eq!(summary.bills_scanned, 1);
        assert_eq!(summary.bills_updated, 0);
        assert_eq!(summary.failures, 1);
    }

    #[test]
    fn filter_new_drops_seen_signatures() {
        let a = Vote {
            member_id: MemberId(1),
            parliament_number: 44,
            session_number: 1,
            vote_date: NaiveDate::from_ymd_opt(2022, 3, 15).unwrap(),
            vote_topic: "A".to_string(),
            subject: "A".to_string(),
            vote_result: "Agreed To".to_string(),
            position: VotePosition::Yea,
        };
        let mut b = a.clone();
        b.vote_topic = "B".to_string();

        let mut seen = HashSet::new();
        seen.insert(a.signature());
        let fresh = filter_new(vec![a, b.clone(), b.clone()], &mut seen);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].vote_topic, "B");
    }
}
