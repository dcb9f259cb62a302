//! Lobby listing - filter, sort and limit a snapshot of registered servers

use std::cmp::Ordering;

use serde::Serialize;
use thiserror::Error;

use crate::registry::ServerRecord;

/// Field a lobby listing is sorted by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Date,
    /// Zero-based metadata index (`data1` is 0)
    Data(usize),
}

impl SortField {
    /// `date` or `data1`..`data8`; anything else sorts by date.
    pub fn parse(field: &str) -> Self {
        field
            .strip_prefix("data")
            .filter(|n| n.len() == 1)
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|n| (1..=8).contains(n))
            .map_or(SortField::Date, |n| SortField::Data(n - 1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    /// Only an exact `ASC` sorts ascending.
    pub fn parse(direction: &str) -> Self {
        if direction == "ASC" {
            SortDirection::Ascending
        } else {
            SortDirection::Descending
        }
    }
}

/// Rejected `lobby2` arguments
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LobbyError {
    #[error("Invalid lobby limit {0:?}")]
    InvalidLimit(String),
}

fn parse_limit(raw: &str) -> Result<usize, LobbyError> {
    raw.parse::<i32>()
        .ok()
        .and_then(|limit| usize::try_from(limit).ok())
        .ok_or_else(|| LobbyError::InvalidLimit(raw.to_string()))
}

/// Parsed `lobby2` arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyQuery {
    /// Exact-match filters per metadata field; empty means no filter
    pub filters: [String; 8],
    pub sort_field: SortField,
    pub direction: SortDirection,
    pub limit: Option<usize>,
}

impl Default for LobbyQuery {
    fn default() -> Self {
        Self {
            filters: Default::default(),
            sort_field: SortField::Date,
            direction: SortDirection::Descending,
            limit: None,
        }
    }
}

impl LobbyQuery {
    /// Build a query from the eleven argument lines of `lobby2`: eight
    /// filters, sort field, sort direction, limit. Missing lines read as empty.
    ///
    /// An empty limit keeps every entry. Anything other than a non-negative
    /// 32-bit integer is rejected.
    pub fn from_arguments(args: &[String]) -> Result<Self, LobbyError> {
        let arg = |i: usize| args.get(i).map(String::as_str).unwrap_or_default();

        let limit = match arg(10) {
            "" => None,
            raw => Some(parse_limit(raw)?),
        };

        Ok(Self {
            filters: std::array::from_fn(|i| arg(i).to_string()),
            sort_field: SortField::parse(arg(8)),
            direction: SortDirection::parse(arg(9)),
            limit,
        })
    }

    fn matches(&self, record: &ServerRecord) -> bool {
        self.filters
            .iter()
            .zip(&record.data)
            .all(|(filter, value)| filter.is_empty() || filter == value)
    }

    fn compare(&self, a: &ServerRecord, b: &ServerRecord) -> Ordering {
        let ordering = match self.sort_field {
            SortField::Date => a.created_time.cmp(&b.created_time),
            SortField::Data(i) => a.data[i].cmp(&b.data[i]),
        };
        match self.direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    }
}

/// Public view of a server in the lobby listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LobbyEntry {
    pub ip: String,
    pub data1: String,
    pub data2: String,
    pub data3: String,
    pub data4: String,
    pub data5: String,
    pub data6: String,
    pub data7: String,
    pub data8: String,
    #[serde(rename = "createdTime")]
    pub created_time: i64,
}

impl From<&ServerRecord> for LobbyEntry {
    fn from(record: &ServerRecord) -> Self {
        let [data1, data2, data3, data4, data5, data6, data7, data8] = record.data.clone();
        Self {
            ip: record.ip.clone(),
            data1,
            data2,
            data3,
            data4,
            data5,
            data6,
            data7,
            data8,
            created_time: record.created_time,
        }
    }
}

/// Run `query` over a registry snapshot. Pending (UDP-only) servers are
/// never listed.
pub fn query<'a, I>(servers: I, query: &LobbyQuery) -> Vec<LobbyEntry>
where
    I: IntoIterator<Item = &'a ServerRecord>,
{
    let mut selected: Vec<&ServerRecord> = servers
        .into_iter()
        .filter(|record| !record.is_pending())
        .filter(|record| query.matches(record))
        .collect();

    selected.sort_by(|a, b| query.compare(a, b));

    if let Some(limit) = query.limit {
        if limit <= selected.len() {
            selected.truncate(limit);
        }
    }

    selected.into_iter().map(LobbyEntry::from).collect()
}
