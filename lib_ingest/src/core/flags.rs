//! # Reader Flags
//!
//! Flags drive what post-processing does with a dispatched event. They are
//! parsed into a closed set of kinds; a flag that does not name a known kind
//! is rejected instead of ignored. A flag may carry ids either as
//! `*flag:ID1&ID2` or as `*flag:*ids:ID1&ID2`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::DispatchError;

/// Every flag understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FlagKind {
    Log,
    DryRun,
    Authorize,
    Initiate,
    Update,
    Terminate,
    Message,
    Cdrs,
    Event,
    None,
    Export,
    Attributes,
    Thresholds,
    Stats,
    Resources,
    Accounts,
    Routes,
    RoutesIgnoreErrors,
    RoutesEventCost,
    /// Carries its cost ceiling as the first parameter.
    RoutesMaxCost,
    ForceDuration,
    ErsStats,
    ErsThresholds,
}

impl FlagKind {
    /// Reply state reported when this step fails, e.g. `ERR_CDRS`.
    pub fn error_state(self) -> String {
        format!("ERR_{}", self.as_str().trim_start_matches('*').to_ascii_uppercase())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlagKind::Log => "*log",
            FlagKind::DryRun => "*dryrun",
            FlagKind::Authorize => "*authorize",
            FlagKind::Initiate => "*initiate",
            FlagKind::Update => "*update",
            FlagKind::Terminate => "*terminate",
            FlagKind::Message => "*message",
            FlagKind::Cdrs => "*cdrs",
            FlagKind::Event => "*event",
            FlagKind::None => "*none",
            FlagKind::Export => "*export",
            FlagKind::Attributes => "*attributes",
            FlagKind::Thresholds => "*thresholds",
            FlagKind::Stats => "*stats",
            FlagKind::Resources => "*resources",
            FlagKind::Accounts => "*accounts",
            FlagKind::Routes => "*routes",
            FlagKind::RoutesIgnoreErrors => "*routes_ignore_errors",
            FlagKind::RoutesEventCost => "*routes_event_cost",
            FlagKind::RoutesMaxCost => "*routes_maxcost",
            FlagKind::ForceDuration => "*fd",
            FlagKind::ErsStats => "*ers_stats",
            FlagKind::ErsThresholds => "*ers_thresholds",
        }
    }
}

impl FromStr for FlagKind {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "*log" => FlagKind::Log,
            "*dryrun" => FlagKind::DryRun,
            "*authorize" => FlagKind::Authorize,
            "*initiate" => FlagKind::Initiate,
            "*update" => FlagKind::Update,
            "*terminate" => FlagKind::Terminate,
            "*message" => FlagKind::Message,
            "*cdrs" => FlagKind::Cdrs,
            "*event" => FlagKind::Event,
            "*none" => FlagKind::None,
            "*export" => FlagKind::Export,
            "*attributes" => FlagKind::Attributes,
            "*thresholds" => FlagKind::Thresholds,
            "*stats" => FlagKind::Stats,
            "*resources" => FlagKind::Resources,
            "*accounts" => FlagKind::Accounts,
            "*routes" => FlagKind::Routes,
            "*routes_ignore_errors" => FlagKind::RoutesIgnoreErrors,
            "*routes_event_cost" => FlagKind::RoutesEventCost,
            "*routes_maxcost" => FlagKind::RoutesMaxCost,
            "*fd" => FlagKind::ForceDuration,
            "*ers_stats" => FlagKind::ErsStats,
            "*ers_thresholds" => FlagKind::ErsThresholds,
            other => return Err(DispatchError::UnsupportedFlag(other.to_string())),
        };
        Ok(kind)
    }
}

impl fmt::Display for FlagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The request type an event is processed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    DryRun,
    Authorize,
    Initiate,
    Update,
    Terminate,
    Message,
    Cdrs,
    Event,
    None,
    Export,
}

impl RequestType {
    /// Candidates in the order they are looked up among a reader's flags.
    pub const PRIORITY: [RequestType; 10] = [
        RequestType::DryRun,
        RequestType::Authorize,
        RequestType::Initiate,
        RequestType::Update,
        RequestType::Terminate,
        RequestType::Message,
        RequestType::Cdrs,
        RequestType::Event,
        RequestType::None,
        RequestType::Export,
    ];

    pub fn flag(self) -> FlagKind {
        match self {
            RequestType::DryRun => FlagKind::DryRun,
            RequestType::Authorize => FlagKind::Authorize,
            RequestType::Initiate => FlagKind::Initiate,
            RequestType::Update => FlagKind::Update,
            RequestType::Terminate => FlagKind::Terminate,
            RequestType::Message => FlagKind::Message,
            RequestType::Cdrs => FlagKind::Cdrs,
            RequestType::Event => FlagKind::Event,
            RequestType::None => FlagKind::None,
            RequestType::Export => FlagKind::Export,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.flag().as_str()
    }

    /// Reply state reported for a failed request, e.g. `ERR_MESSAGE`.
    pub fn error_state(self) -> String {
        self.flag().error_state()
    }
}

/// Parsed flags of one reader.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagSet {
    flags: BTreeMap<FlagKind, Vec<String>>,
}

impl FlagSet {
    /// Parses every flag; the first unknown one fails the whole set.
    pub fn parse<S: AsRef<str>>(flags: &[S]) -> Result<Self, DispatchError> {
        let mut set = FlagSet::default();
        for flag in flags {
            let (kind, ids) = parse_flag(flag.as_ref())?;
            set.flags.entry(kind).or_default().extend(ids);
        }
        Ok(set)
    }

    pub fn has(&self, kind: FlagKind) -> bool {
        self.flags.contains_key(&kind)
    }

    /// Ids attached to `kind`; empty when the flag is absent or bare.
    pub fn ids(&self, kind: FlagKind) -> &[String] {
        self.flags.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    /// `Some(ids)` when the flag is present, for optional subsystem calls.
    pub fn ids_if_set(&self, kind: FlagKind) -> Option<Vec<String>> {
        self.flags.get(&kind).cloned()
    }

    /// The highest-priority request type present among the flags.
    pub fn request_type(&self) -> Option<RequestType> {
        RequestType::PRIORITY.into_iter().find(|r| self.has(r.flag()))
    }

    pub fn is_dry_run(&self) -> bool {
        self.has(FlagKind::DryRun)
    }

    pub fn names(&self) -> Vec<String> {
        self.flags.keys().map(|k| k.as_str().to_string()).collect()
    }
}

fn parse_flag(flag: &str) -> Result<(FlagKind, Vec<String>), DispatchError> {
    let (name, params) = match flag.split_once(':') {
        Some((name, params)) => (name, Some(params)),
        None => (flag, None),
    };
    let kind = name.trim().parse::<FlagKind>()?;
    let ids = params
        .map(|p| p.strip_prefix("*ids:").unwrap_or(p))
        .map(|p| {
            p.split('&')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok((kind, ids))
}
