//! Core domain model for the parliamentary sync engine: owner identifiers,
//! entity records, dedupe signatures, and source date parsing.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Member identifiers at or above this value were synthesized locally for
/// historical members the source never assigned an ID. They have no remote
/// profile URL and are excluded from per-member fetch jobs.
pub const SYNTHESIZED_MEMBER_ID_START: i64 = 900_000;

/// Vote subjects longer than this are truncated into the topic column.
pub const VOTE_TOPIC_MAX_CHARS: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(pub i64);

impl MemberId {
    pub fn is_synthesized(self) -> bool {
        self.0 >= SYNTHESIZED_MEMBER_ID_START
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A member as the sync loop iterates it: source ID plus display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRef {
    pub id: MemberId,
    pub name: String,
}

impl MemberRef {
    /// Lowercase dashed form of the name, e.g. "Ziad Aboultaif" -> "ziad-aboultaif".
    pub fn slug(&self) -> String {
        self.name.to_lowercase().replace(' ', "-")
    }

    /// The profile path segment ourcommons.ca uses, e.g. "ziad-aboultaif(89156)".
    pub fn search_pattern(&self) -> String {
        format!("{}({})", self.slug(), self.id)
    }
}

impl fmt::Display for MemberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Natural key of a bill: formatted number within one parliament session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BillKey {
    pub number: String,
    pub parliament: i32,
    pub session: i32,
}

impl BillKey {
    pub fn new(number: impl Into<String>, parliament: i32, session: i32) -> Self {
        Self {
            number: number.into(),
            parliament,
            session,
        }
    }

    /// Splits "C-215" into ("C", "215"). `None` when the number has no dash,
    /// which means no LEGISinfo detail URL can be built for it.
    pub fn prefix_and_digits(&self) -> Option<(&str, &str)> {
        let (prefix, digits) = self.number.split_once('-')?;
        if prefix.is_empty() || digits.is_empty() {
            return None;
        }
        Some((prefix, digits))
    }
}

impl fmt::Display for BillKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}-{})", self.number, self.parliament, self.session)
    }
}

/// A bill as the progress job iterates it: store row ID plus natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillRef {
    pub id: i64,
    pub key: BillKey,
}

#[derive(Debug, Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleKind {
    MemberOfParliament,
    PoliticalAffiliation,
    CommitteeMember,
    ParliamentaryAssociation,
    ElectionCandidate,
    ParliamentarianOffice,
}

impl RoleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RoleKind::MemberOfParliament => "Member of Parliament",
            RoleKind::PoliticalAffiliation => "Political Affiliation",
            RoleKind::CommitteeMember => "Committee Member",
            RoleKind::ParliamentaryAssociation => "Parliamentary Association",
            RoleKind::ElectionCandidate => "Election Candidate",
            RoleKind::ParliamentarianOffice => "Parliamentarian Office",
        }
    }
}

impl FromStr for RoleKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Member of Parliament" => Ok(RoleKind::MemberOfParliament),
            "Political Affiliation" => Ok(RoleKind::PoliticalAffiliation),
            "Committee Member" => Ok(RoleKind::CommitteeMember),
            "Parliamentary Association" => Ok(RoleKind::ParliamentaryAssociation),
            "Election Candidate" => Ok(RoleKind::ElectionCandidate),
            "Parliamentarian Office" => Ok(RoleKind::ParliamentarianOffice),
            other => Err(UnknownVariant {
                kind: "role kind",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Chamber {
    HouseOfCommons,
    Senate,
}

impl Chamber {
    /// LEGISinfo originating-chamber code: 1 is the House, everything else Senate.
    pub fn from_chamber_code(code: &str) -> Self {
        if code.trim() == "1" {
            Chamber::HouseOfCommons
        } else {
            Chamber::Senate
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Chamber::HouseOfCommons => "House of Commons",
            Chamber::Senate => "Senate",
        }
    }
}

impl fmt::Display for Chamber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VotePosition {
    Yea,
    Nay,
    Paired,
    Abstained,
}

impl VotePosition {
    pub fn as_str(self) -> &'static str {
        match self {
            VotePosition::Yea => "Yea",
            VotePosition::Nay => "Nay",
            VotePosition::Paired => "Paired",
            VotePosition::Abstained => "Abstained",
        }
    }
}

impl FromStr for VotePosition {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            v if v.eq_ignore_ascii_case("yea") => Ok(VotePosition::Yea),
            v if v.eq_ignore_ascii_case("nay") => Ok(VotePosition::Nay),
            v if v.eq_ignore_ascii_case("paired") => Ok(VotePosition::Paired),
            v if v.eq_ignore_ascii_case("abstained") => Ok(VotePosition::Abstained),
            other => Err(UnknownVariant {
                kind: "vote position",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle state of one bill stage in the progress JSON. The source encodes
/// this as a numeric `State` with a parallel `StateName` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageState {
    NotReached,
    NoActivity,
    Completed,
    NotCompleted,
}

impl StageState {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(StageState::NotReached),
            2 | 3 => Some(StageState::NoActivity),
            4 => Some(StageState::Completed),
            5 => Some(StageState::NotCompleted),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            n if n.eq_ignore_ascii_case("not reached") => Some(StageState::NotReached),
            n if n.eq_ignore_ascii_case("no activity") => Some(StageState::NoActivity),
            n if n.eq_ignore_ascii_case("completed") => Some(StageState::Completed),
            n if n.eq_ignore_ascii_case("not completed") => Some(StageState::NotCompleted),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageState::NotReached => "Not reached",
            StageState::NoActivity => "No activity",
            StageState::Completed => "Completed",
            StageState::NotCompleted => "Not completed",
        }
    }
}

/// A time-boxed position held by a member. Append-only: an end date appearing
/// later for a previously open-ended role is never written back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub member_id: MemberId,
    pub kind: RoleKind,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub parliament_number: Option<i32>,
    pub session_number: Option<i32>,
    pub constituency_name: Option<String>,
    pub constituency_province: Option<String>,
    pub party: Option<String>,
    pub committee_name: Option<String>,
    pub affiliation_role_name: Option<String>,
    pub organization_name: Option<String>,
    pub office_role: Option<String>,
    pub election_result: Option<String>,
}

impl Role {
    pub fn new(member_id: MemberId, kind: RoleKind) -> Self {
        Self {
            member_id,
            kind,
            start_date: None,
            end_date: None,
            parliament_number: None,
            session_number: None,
            constituency_name: None,
            constituency_province: None,
            party: None,
            committee_name: None,
            affiliation_role_name: None,
            organization_name: None,
            office_role: None,
            election_result: None,
        }
    }
}

/// One member's recorded position on one division. The source exposes no
/// stable identifier at the member level, so identity is the signature below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub member_id: MemberId,
    pub parliament_number: i32,
    pub session_number: i32,
    pub vote_date: NaiveDate,
    pub vote_topic: String,
    pub subject: String,
    pub vote_result: String,
    pub position: VotePosition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bill {
    pub key: BillKey,
    pub status: String,
    pub chamber: Chamber,
    pub short_title: Option<String>,
    pub long_title: Option<String>,
    pub sponsor_name: Option<String>,
    pub sponsor_id: Option<MemberId>,
}

/// One stage event in a bill's lifecycle. A log, not a current-state pointer:
/// a bill accumulates stage rows across syncs as its status advances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillStage {
    pub bill_id: i64,
    pub stage_name: String,
    pub state: StageState,
    pub chamber: Chamber,
    pub observed_date: NaiveDate,
}

/// Enrichment fields the backfill job fills into NULL bill columns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillDetails {
    pub sponsor_name: Option<String>,
    pub bill_type: Option<String>,
    pub introduction_date: Option<NaiveDate>,
    pub summary: Option<String>,
}

impl BillDetails {
    pub fn is_empty(&self) -> bool {
        self.sponsor_name.is_none()
            && self.bill_type.is_none()
            && self.introduction_date.is_none()
            && self.summary.is_none()
    }
}

/// Opaque dedupe signature: a deterministic join of the identity fields of a
/// record. The diff engine compares these without knowing what they mean.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(String);

const SIG_SEP: char = '\u{1f}';

impl Signature {
    pub fn of(parts: &[&str]) -> Self {
        let mut joined = String::new();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                joined.push(SIG_SEP);
            }
            joined.push_str(part);
        }
        Signature(joined)
    }
}

pub trait DedupeSignature {
    fn signature(&self) -> Signature;
}

fn date_part(date: Option<NaiveDate>) -> String {
    date.map(|d| d.to_string()).unwrap_or_default()
}

fn int_part(value: Option<i32>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Signature constructors are shared between parsed records and store rows so
/// both sides always agree on identity.
pub fn role_signature(
    member_id: MemberId,
    kind: &str,
    start_date: Option<NaiveDate>,
    parliament: Option<i32>,
    session: Option<i32>,
    committee_name: Option<&str>,
    organization_name: Option<&str>,
) -> Signature {
    Signature::of(&[
        &member_id.to_string(),
        kind,
        &date_part(start_date),
        &int_part(parliament),
        &int_part(session),
        committee_name.unwrap_or(""),
        organization_name.unwrap_or(""),
    ])
}

pub fn vote_signature(
    member_id: MemberId,
    parliament: i32,
    session: i32,
    vote_date: NaiveDate,
    vote_topic: &str,
) -> Signature {
    Signature::of(&[
        &member_id.to_string(),
        &parliament.to_string(),
        &session.to_string(),
        &vote_date.to_string(),
        vote_topic,
    ])
}

pub fn bill_signature(key: &BillKey) -> Signature {
    Signature::of(&[
        &key.number,
        &key.parliament.to_string(),
        &key.session.to_string(),
    ])
}

pub fn stage_signature(bill_id: i64, stage_name: &str, observed_date: NaiveDate) -> Signature {
    Signature::of(&[
        &bill_id.to_string(),
        stage_name,
        &observed_date.to_string(),
    ])
}

impl DedupeSignature for Role {
    fn signature(&self) -> Signature {
        role_signature(
            self.member_id,
            self.kind.as_str(),
            self.start_date,
            self.parliament_number,
            self.session_number,
            self.committee_name.as_deref(),
            self.organization_name.as_deref(),
        )
    }
}

impl DedupeSignature for Vote {
    fn signature(&self) -> Signature {
        vote_signature(
            self.member_id,
            self.parliament_number,
            self.session_number,
            self.vote_date,
            &self.vote_topic,
        )
    }
}

impl DedupeSignature for Bill {
    fn signature(&self) -> Signature {
        bill_signature(&self.key)
    }
}

impl DedupeSignature for BillStage {
    fn signature(&self) -> Signature {
        stage_signature(self.bill_id, &self.stage_name, self.observed_date)
    }
}

/// Truncates a vote subject into the topic column on a char boundary.
pub fn truncate_topic(subject: &str) -> String {
    match subject.char_indices().nth(VOTE_TOPIC_MAX_CHARS) {
        Some((idx, _)) => subject[..idx].to_string(),
        None => subject.to_string(),
    }
}

/// Parses every date shape the sources are known to emit:
/// a weekday-qualified long form ("Monday, September 20, 2021"), an ISO
/// datetime with optional fractional seconds ("2021-11-23T14:20:19.547"),
/// and a bare ISO date ("2021-11-23"). Returns `None` rather than erroring.
pub fn parse_flexible_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    if let Some((date_part, _time)) = raw.split_once('T') {
        if let Ok(date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
            return Some(date);
        }
    }
    NaiveDate::parse_from_str(raw, "%A, %B %d, %Y").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weekday_long_form_parses() {
        assert_eq!(
            parse_flexible_date("Monday, September 20, 2021"),
            NaiveDate::from_ymd_opt(2021, 9, 20)
        );
    }

    #[test]
    fn iso_datetime_with_fractional_seconds_parses() {
        assert_eq!(
            parse_flexible_date("2021-11-23T14:20:19.547"),
            NaiveDate::from_ymd_opt(2021, 11, 23)
        );
    }

    #[test]
    fn iso_datetime_without_fraction_parses() {
        assert_eq!(
            parse_flexible_date("2022-03-15T19:30:00"),
            NaiveDate::from_ymd_opt(2022, 3, 15)
        );
    }

    #[test]
    fn bare_iso_date_parses() {
        assert_eq!(
            parse_flexible_date("2021-11-23"),
            NaiveDate::from_ymd_opt(2021, 11, 23)
        );
    }

    #[test]
    fn garbage_dates_yield_none() {
        assert_eq!(parse_flexible_date(""), None);
        assert_eq!(parse_flexible_date("  "), None);
        assert_eq!(parse_flexible_date("Sometime in 2021"), None);
        // Weekday must match the calendar date.
        assert_eq!(parse_flexible_date("Tuesday, September 20, 2021"), None);
    }

    #[test]
    fn search_pattern_matches_source_url_shape() {
        let member = MemberRef {
            id: MemberId(89156),
            name: "Ziad Aboultaif".to_string(),
        };
        assert_eq!(member.search_pattern(), "ziad-aboultaif(89156)");
    }

    #[test]
    fn synthesized_member_ids_are_detected() {
        assert!(!MemberId(25645).is_synthesized());
        assert!(MemberId(900_000).is_synthesized());
        assert!(MemberId(900_417).is_synthesized());
    }

    #[test]
    fn bill_key_splits_into_prefix_and_digits() {
        assert_eq!(
            BillKey::new("C-215", 44, 1).prefix_and_digits(),
            Some(("C", "215"))
        );
        assert_eq!(
            BillKey::new("S-4", 43, 2).prefix_and_digits(),
            Some(("S", "4"))
        );
        assert_eq!(BillKey::new("C215", 44, 1).prefix_and_digits(), None);
        assert_eq!(BillKey::new("-215", 44, 1).prefix_and_digits(), None);
    }

    #[test]
    fn vote_signatures_agree_between_record_and_constructor() {
        let vote = Vote {
            member_id: MemberId(25645),
            parliament_number: 44,
            session_number: 1,
            vote_date: NaiveDate::from_ymd_opt(2022, 3, 15).unwrap(),
            vote_topic: "Budget Implementation Act".to_string(),
            subject: "Budget Implementation Act".to_string(),
            vote_result: "Agreed To".to_string(),
            position: VotePosition::Yea,
        };
        assert_eq!(
            vote.signature(),
            vote_signature(
                MemberId(25645),
                44,
                1,
                NaiveDate::from_ymd_opt(2022, 3, 15).unwrap(),
                "Budget Implementation Act",
            )
        );
    }

    #[test]
    fn role_signature_ignores_non_identity_fields() {
        let mut a = Role::new(MemberId(1), RoleKind::CommitteeMember);
        a.start_date = NaiveDate::from_ymd_opt(2021, 12, 9);
        a.parliament_number = Some(44);
        a.session_number = Some(1);
        a.committee_name = Some("Standing Committee on Finance".to_string());
        let mut b = a.clone();
        b.affiliation_role_name = Some("Vice-Chair".to_string());
        assert_eq!(a.signature(), b.signature());

        b.committee_name = Some("Standing Committee on Health".to_string());
        assert_ne!(a.signature(), b.signature());
    }

    #[test]
    fn signature_fields_do_not_collide_across_boundaries() {
        // "ab" + "c" must not equal "a" + "bc".
        assert_ne!(Signature::of(&["ab", "c"]), Signature::of(&["a", "bc"]));
    }

    #[test]
    fn topic_truncation_respects_char_boundaries() {
        let subject = "é".repeat(300);
        let topic = truncate_topic(&subject);
        assert_eq!(topic.chars().count(), VOTE_TOPIC_MAX_CHARS);

        let short = "An Act respecting cider";
        assert_eq!(truncate_topic(short), short);
    }

    #[test]
    fn stage_state_codes_and_names_map() {
        assert_eq!(StageState::from_code(4), Some(StageState::Completed));
        assert_eq!(StageState::from_code(5), Some(StageState::NotCompleted));
        assert_eq!(StageState::from_code(1), Some(StageState::NotReached));
        assert_eq!(StageState::from_code(99), None);
        assert_eq!(
            StageState::from_name("Completed"),
            Some(StageState::Completed)
        );
        assert_eq!(
            StageState::from_name("not reached"),
            Some(StageState::NotReached)
        );
    }

    #[test]
    fn role_kind_round_trips_through_strings() {
        for kind in [
            RoleKind::MemberOfParliament,
            RoleKind::PoliticalAffiliation,
            RoleKind::CommitteeMember,
            RoleKind::ParliamentaryAssociation,
            RoleKind::ElectionCandidate,
            RoleKind::ParliamentarianOffice,
        ] {
            assert_eq!(kind.as_str().parse::<RoleKind>().unwrap(), kind);
        }
        assert!("Backbencher".parse::<RoleKind>().is_err());
    }

    #[test]
    fn vote_positions_parse_case_insensitively() {
        assert_eq!("Yea".parse::<VotePosition>().unwrap(), VotePosition::Yea);
        assert_eq!("nay".parse::<VotePosition>().unwrap(), VotePosition::Nay);
        assert_eq!(
            "PAIRED".parse::<VotePosition>().unwrap(),
            VotePosition::Paired
        );
        assert!("Present".parse::<VotePosition>().is_err());
    }
}
