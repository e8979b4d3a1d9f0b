//! Source adapters: URL templates for the ourcommons.ca and LEGISinfo
//! endpoints, plus lenient parsers turning their XML, HTML, and JSON payloads
//! into domain records.
//!
//! Parsers never fail the whole payload over one bad fragment. A record
//! missing an identity field is skipped and reported as a warning; optional
//! fields that fail to parse degrade to `None`.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::NaiveDate;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;

use parly_core::{
    parse_flexible_date, truncate_topic, Bill, BillDetails, BillKey, BillStage, Chamber, MemberId,
    MemberRef, Role, RoleKind, StageState, Vote, VotePosition,
};

/// Member directory listing every current MP with a profile link.
pub const MEMBER_DIRECTORY_URL: &str = "https://www.ourcommons.ca/members/en/search?view=list";

pub fn member_roles_url(member: &MemberRef) -> String {
    format!(
        "https://www.ourcommons.ca/members/en/{}/roles/xml",
        member.search_pattern()
    )
}

pub fn member_votes_url(member: &MemberRef) -> String {
    format!(
        "https://www.ourcommons.ca/members/en/{}/votes/xml",
        member.search_pattern()
    )
}

pub fn session_bills_url(parliament: i32, session: i32) -> String {
    format!("https://www.parl.ca/legisinfo/en/bills/xml?parlsession={parliament}-{session}")
}

/// LEGISinfo bill detail JSON. `None` when the formatted number cannot be
/// split into prefix and digits, in which case no URL exists for the bill.
pub fn bill_json_url(key: &BillKey) -> Option<String> {
    let (prefix, digits) = key.prefix_and_digits()?;
    Some(format!(
        "https://www.parl.ca/legisinfo/en/bill/{}-{}/{}-{}/json",
        key.parliament, key.session, prefix, digits
    ))
}

pub fn bill_progress_url(key: &BillKey) -> Option<String> {
    bill_json_url(key).map(|url| format!("{url}?view=progress"))
}

#[derive(Debug, Clone)]
pub struct ParseWarning {
    pub message: String,
}

/// Records extracted from one payload, plus everything skipped along the way.
#[derive(Debug)]
pub struct Parsed<T> {
    pub records: Vec<T>,
    pub warnings: Vec<ParseWarning>,
}

impl<T> Parsed<T> {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(ParseWarning {
            message: message.into(),
        });
    }
}

impl<T> Default for Parsed<T> {
    fn default() -> Self {
        Self::new()
    }
}

// The HTML parser lowercases element and attribute names, so selectors are
// written in lowercase regardless of how the source spells its tags.
fn sel(selector: &str) -> Selector {
    Selector::parse(selector).expect("static selector")
}

fn is_nil(el: ElementRef<'_>) -> bool {
    el.value()
        .attr("xsi:nil")
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// First matching child's trimmed text. `None` for absent, empty, or
/// explicitly nil elements.
fn child_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    let el = scope.select(selector).next()?;
    if is_nil(el) {
        return None;
    }
    let text = el.text().collect::<String>().trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn child_date(
    scope: ElementRef<'_>,
    selector: &Selector,
    out: &mut Parsed<Role>,
    what: &str,
) -> Option<NaiveDate> {
    let raw = child_text(scope, selector)?;
    let date = parse_flexible_date(&raw);
    if date.is_none() {
        out.warn(format!("unparseable {what} {raw:?}"));
    }
    date
}

fn child_i32(scope: ElementRef<'_>, selector: &Selector) -> Option<i32> {
    child_text(scope, selector)?.parse().ok()
}

/// Parses the six role blocks of a member's roles XML.
pub fn parse_roles_xml(payload: &[u8], member_id: MemberId) -> Parsed<Role> {
    let doc = Html::parse_document(&String::from_utf8_lossy(payload));
    let mut out = Parsed::new();

    let from_date = sel("fromdatetime");
    let to_date = sel("todatetime");
    let parliament = sel("parliamentnumber");
    let session = sel("sessionnumber");
    let constituency = sel("constituencyname");
    let province = sel("constituencyprovinceterritoryname");

    for el in doc.select(&sel("memberofparliamentrole")) {
        let mut role = Role::new(member_id, RoleKind::MemberOfParliament);
        role.start_date = child_date(el, &from_date, &mut out, "start date");
        role.end_date = child_date(el, &to_date, &mut out, "end date");
        role.constituency_name = child_text(el, &constituency);
        role.constituency_province = child_text(el, &province);
        out.records.push(role);
    }

    let caucus = sel("caucusshortname");
    for el in doc.select(&sel("caucusmemberrole")) {
        let mut role = Role::new(member_id, RoleKind::PoliticalAffiliation);
        role.start_date = child_date(el, &from_date, &mut out, "start date");
        role.end_date = child_date(el, &to_date, &mut out, "end date");
        role.parliament_number = child_i32(el, &parliament);
        role.party = child_text(el, &caucus);
        out.records.push(role);
    }

    let committee = sel("committeename");
    let affiliation = sel("affiliationrolename");
    for el in doc.select(&sel("committeememberrole")) {
        let mut role = Role::new(member_id, RoleKind::CommitteeMember);
        role.start_date = child_date(el, &from_date, &mut out, "start date");
        role.end_date = child_date(el, &to_date, &mut out, "end date");
        role.parliament_number = child_i32(el, &parliament);
        role.session_number = child_i32(el, &session);
        role.committee_name = child_text(el, &committee);
        role.affiliation_role_name = child_text(el, &affiliation);
        out.records.push(role);
    }

    let assoc_role = sel("associationmemberroletype");
    let organization = sel("organization");
    for el in doc.select(&sel(
        "parliamentaryassociationsandinterparliamentarygrouprole",
    )) {
        // Association blocks carry no dates in the source.
        let mut role = Role::new(member_id, RoleKind::ParliamentaryAssociation);
        role.affiliation_role_name = child_text(el, &assoc_role);
        role.organization_name = child_text(el, &organization);
        out.records.push(role);
    }

    let election_date = sel("electionenddate");
    let party = sel("politicalpartyname");
    let result = sel("resolvedelectionresulttypename");
    for el in doc.select(&sel("electioncandidaterole")) {
        let mut role = Role::new(member_id, RoleKind::ElectionCandidate);
        role.start_date = child_date(el, &election_date, &mut out, "election date");
        role.constituency_name = child_text(el, &constituency);
        role.constituency_province = child_text(el, &province);
        role.party = child_text(el, &party);
        role.election_result = child_text(el, &result);
        out.records.push(role);
    }

    let position = sel("positionname");
    for el in doc.select(&sel("parliamentarypositionrole")) {
        let mut role = Role::new(member_id, RoleKind::ParliamentarianOffice);
        role.start_date = child_date(el, &from_date, &mut out, "start date");
        role.end_date = child_date(el, &to_date, &mut out, "end date");
        role.parliament_number = child_i32(el, &parliament);
        role.office_role = child_text(el, &position);
        out.records.push(role);
    }

    out
}

/// Parses a member's votes XML. A vote needs parliament, session, a valid
/// date, and a recognized position; anything else is skipped with a warning.
pub fn parse_votes_xml(payload: &[u8], member_id: MemberId) -> Parsed<Vote> {
    let doc = Html::parse_document(&String::from_utf8_lossy(payload));
    let mut out = Parsed::new();

    let parliament = sel("parliamentnumber");
    let session = sel("sessionnumber");
    let date = sel("decisioneventdatetime");
    let subject = sel("decisiondivisionsubject");
    let result = sel("decisionresultname");
    let value = sel("votevaluename");

    for el in doc.select(&sel("membervote")) {
        let Some(parliament_number) = child_i32(el, &parliament) else {
            out.warn("vote missing parliament number");
            continue;
        };
        let Some(session_number) = child_i32(el, &session) else {
            out.warn("vote missing session number");
            continue;
        };
        let Some(vote_date) = child_text(el, &date).as_deref().and_then(parse_flexible_date)
        else {
            out.warn("vote missing or unparseable decision date");
            continue;
        };
        let position = match child_text(el, &value) {
            Some(raw) => match VotePosition::from_str(&raw) {
                Ok(position) => position,
                Err(err) => {
                    out.warn(err.to_string());
                    continue;
                }
            },
            None => {
                out.warn("vote missing position");
                continue;
            }
        };

        let subject_text = child_text(el, &subject).unwrap_or_else(|| "Unknown".to_string());
        out.records.push(Vote {
            member_id,
            parliament_number,
            session_number,
            vote_date,
            vote_topic: truncate_topic(&subject_text),
            subject: subject_text,
            vote_result: child_text(el, &result).unwrap_or_else(|| "Unknown".to_string()),
            position,
        });
    }

    out
}

/// Parses the per-session bills XML listing.
pub fn parse_bills_xml(payload: &[u8]) -> Parsed<Bill> {
    let doc = Html::parse_document(&String::from_utf8_lossy(payload));
    let mut out = Parsed::new();

    let number = sel("billnumberformatted");
    let parliament = sel("parliamentnumber");
    let session = sel("sessionnumber");
    let short_title = sel("shorttitleen");
    let long_title = sel("longtitleen");
    let status = sel("latestcompletedmajorstageen");
    let chamber = sel("originatingchamberid");
    let sponsor = sel("sponsoren");

    for el in doc.select(&sel("bill")) {
        let Some(bill_number) = child_text(el, &number) else {
            out.warn("bill missing formatted number");
            continue;
        };
        let Some(parliament_number) = child_i32(el, &parliament) else {
            out.warn(format!("bill {bill_number} missing parliament number"));
            continue;
        };
        let Some(session_number) = child_i32(el, &session) else {
            out.warn(format!("bill {bill_number} missing session number"));
            continue;
        };

        out.records.push(Bill {
            key: BillKey::new(bill_number, parliament_number, session_number),
            status: child_text(el, &status).unwrap_or_else(|| "Introduced".to_string()),
            chamber: child_text(el, &chamber)
                .map_or(Chamber::Senate, |code| Chamber::from_chamber_code(&code)),
            short_title: child_text(el, &short_title),
            long_title: child_text(el, &long_title),
            sponsor_name: child_text(el, &sponsor),
            sponsor_id: None,
        });
    }

    out
}

#[derive(Debug, Deserialize)]
struct StagePayload {
    #[serde(rename = "BillStageName")]
    name: Option<String>,
    #[serde(rename = "StateAsOfDate")]
    state_as_of: Option<String>,
    #[serde(rename = "State")]
    state: Option<i64>,
    #[serde(rename = "StateName")]
    state_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StagesPayload {
    #[serde(rename = "HouseBillStages", default)]
    house: Vec<StagePayload>,
    #[serde(rename = "SenateBillStages", default)]
    senate: Vec<StagePayload>,
}

#[derive(Debug, Deserialize)]
struct BillPayload {
    #[serde(rename = "BillStages", default)]
    stages: StagesPayload,
    #[serde(rename = "SponsorPersonName")]
    sponsor_person_name: Option<String>,
    #[serde(rename = "IsGovernmentBill", default)]
    is_government_bill: bool,
    #[serde(rename = "PassedHouseFirstReadingDateTime")]
    passed_house_first_reading: Option<String>,
    #[serde(rename = "PassedSenateFirstReadingDateTime")]
    passed_senate_first_reading: Option<String>,
    #[serde(rename = "LatestBillEventDateTime")]
    latest_bill_event: Option<String>,
    #[serde(rename = "ShortLegislativeSummaryEn")]
    short_summary: Option<String>,
}

/// The API wraps the bill object in a one-element array on some endpoints
/// and returns it bare on others.
fn unwrap_bill_payload(payload: &[u8]) -> Result<BillPayload, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    let value = match value {
        serde_json::Value::Array(mut items) if !items.is_empty() => items.remove(0),
        other => other,
    };
    serde_json::from_value(value)
}

/// Parses the progress view of a bill's JSON into stage events, both
/// chambers. A stage needs a date and a resolvable lifecycle state.
pub fn parse_progress_json(payload: &[u8], bill_id: i64) -> Parsed<BillStage> {
    let mut out = Parsed::new();
    let bill = match unwrap_bill_payload(payload) {
        Ok(bill) => bill,
        Err(err) => {
            out.warn(format!("unparseable progress payload: {err}"));
            return out;
        }
    };

    let chambers = [
        (Chamber::HouseOfCommons, bill.stages.house),
        (Chamber::Senate, bill.stages.senate),
    ];
    for (chamber, stages) in chambers {
        for stage in stages {
            let stage_name = stage.name.unwrap_or_else(|| "Unknown".to_string());
            let Some(observed_date) = stage
                .state_as_of
                .as_deref()
                .and_then(parse_flexible_date)
            else {
                out.warn(format!("stage {stage_name:?} missing observed date"));
                continue;
            };
            let state = stage
                .state
                .and_then(StageState::from_code)
                .or_else(|| stage.state_name.as_deref().and_then(StageState::from_name));
            let Some(state) = state else {
                out.warn(format!("stage {stage_name:?} has unknown state"));
                continue;
            };
            out.records.push(BillStage {
                bill_id,
                stage_name,
                state,
                chamber,
                observed_date,
            });
        }
    }

    out
}

/// Extracts the enrichment fields from a bill's detail JSON. Introduction
/// date prefers the chamber first-reading timestamps over the latest event.
pub fn parse_bill_details_json(payload: &[u8]) -> Result<BillDetails, serde_json::Error> {
    let bill = unwrap_bill_payload(payload)?;

    let introduction_date = [
        bill.passed_house_first_reading.as_deref(),
        bill.passed_senate_first_reading.as_deref(),
        bill.latest_bill_event.as_deref(),
    ]
    .into_iter()
    .flatten()
    .find_map(parse_flexible_date);

    Ok(BillDetails {
        sponsor_name: bill
            .sponsor_person_name
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        bill_type: Some(if bill.is_government_bill {
            "government".to_string()
        } else {
            "private-public".to_string()
        }),
        introduction_date,
        summary: bill
            .short_summary
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
    })
}

/// Scrapes the member directory listing for profile links of the shape
/// `/members/en/{name}-{id}`, deduplicated by ID in ascending order.
pub fn parse_member_directory_html(payload: &[u8]) -> Parsed<MemberRef> {
    let doc = Html::parse_document(&String::from_utf8_lossy(payload));
    let mut out = Parsed::new();
    let mut by_id: BTreeMap<i64, String> = BTreeMap::new();

    for el in doc.select(&sel("a[href]")) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        if !href.to_ascii_lowercase().contains("/members/en/") {
            continue;
        }
        let Some((slug_part, id_part)) = href.rsplit_once('-') else {
            continue;
        };
        if id_part.is_empty() || !id_part.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let Ok(id) = id_part.parse::<i64>() else {
            continue;
        };
        let Some(slug) = slug_part.rsplit('/').next() else {
            continue;
        };
        if slug.is_empty() {
            continue;
        }
        by_id.entry(id).or_insert_with(|| title_case_slug(slug));
    }

    out.records = by_id
        .into_iter()
        .map(|(id, name)| MemberRef {
            id: MemberId(id),
            name,
        })
        .collect();
    out
}

fn title_case_slug(slug: &str) -> String {
    slug.split('-')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
