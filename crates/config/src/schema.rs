//! The configuration schema.
//!
//! Every key the daemons understand is declared here with its type, default,
//! and whether the runtime override file may mask it. Parsing rejects
//! anything not in this table, so typos fail loudly at startup instead of
//! silently running with defaults.

/// Validator applied to a key's value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    /// Free-form string.
    Str,
    /// Integer, zero allowed (`reqint`).
    Int,
    /// Integer, strictly positive (`reqposint`).
    PosInt,
}

/// Declaration of one configuration key.
#[derive(Debug)]
pub struct KeySpec {
    /// Key name as written in the configuration file.
    pub name: &'static str,
    /// Validator for the value.
    pub kind: ValueKind,
    /// Default applied when the file omits the key. `None` with
    /// `required = true` means the key must be present.
    pub default: Option<&'static str>,
    /// Whether the key must appear in the configuration file.
    pub required: bool,
    /// Whether the runtime override file may mask this key.
    pub can_override: bool,
}

const fn key(
    name: &'static str,
    kind: ValueKind,
    default: Option<&'static str>,
    required: bool,
    can_override: bool,
) -> KeySpec {
    KeySpec {
        name,
        kind,
        default,
        required,
        can_override,
    }
}

/// The full schema.
///
/// Sizes are user-facing GiB (`*_usage`, `retriever_buffersize`); durations
/// are seconds; thresholds 2..9 are optional rungs of the archiver ladder.
pub const KEYS: &[KeySpec] = &[
    key("dir", ValueKind::Str, None, true, false),
    key("logdir", ValueKind::Str, None, false, false),
    key("statdir", ValueKind::Str, Some("/run/endit"), false, false),
    key("desc_short", ValueKind::Str, Some("endit"), false, false),
    key("dsmcopts", ValueKind::Str, Some(""), false, false),
    key(
        "dsmc_displayopts",
        ValueKind::Str,
        Some("-dateformat=3 -timeformat=1 -numberformat=1"),
        false,
        false,
    ),
    key("dsmc_cpulimit", ValueKind::PosInt, Some("172800"), false, true),
    key("sleeptime", ValueKind::PosInt, Some("60"), false, true),
    key("debug", ValueKind::Int, Some("0"), false, true),
    key(
        "overridefile",
        ValueKind::Str,
        Some("endit-override.json"),
        false,
        false,
    ),
    key("archiver_timeout", ValueKind::PosInt, Some("21600"), false, true),
    key(
        "archiver_retrytimeout",
        ValueKind::PosInt,
        Some("3600"),
        false,
        true,
    ),
    key(
        "archiver_threshold1_usage",
        ValueKind::PosInt,
        Some("500"),
        false,
        true,
    ),
    key("archiver_threshold2_usage", ValueKind::PosInt, None, false, true),
    key("archiver_threshold3_usage", ValueKind::PosInt, None, false, true),
    key("archiver_threshold4_usage", ValueKind::PosInt, None, false, true),
    key("archiver_threshold5_usage", ValueKind::PosInt, None, false, true),
    key("archiver_threshold6_usage", ValueKind::PosInt, None, false, true),
    key("archiver_threshold7_usage", ValueKind::PosInt, None, false, true),
    key("archiver_threshold8_usage", ValueKind::PosInt, None, false, true),
    key("archiver_threshold9_usage", ValueKind::PosInt, None, false, true),
    key("retriever_maxworkers", ValueKind::PosInt, Some("1"), false, true),
    key(
        "retriever_remountdelay",
        ValueKind::Int,
        Some("600"),
        false,
        true,
    ),
    key(
        "retriever_reqlistfillwait",
        ValueKind::Int,
        Some("600"),
        false,
        true,
    ),
    key(
        "retriever_reqlistfillwaitmax",
        ValueKind::Int,
        Some("1800"),
        false,
        true,
    ),
    key(
        "retriever_buffersize",
        ValueKind::PosInt,
        Some("1000"),
        false,
        true,
    ),
    key(
        "retriever_backlogthreshold",
        ValueKind::Int,
        Some("10"),
        false,
        true,
    ),
    key(
        "retriever_killthreshold",
        ValueKind::Int,
        Some("95"),
        false,
        true,
    ),
    key("retriever_hintfile", ValueKind::Str, None, false, true),
    key(
        "deleter_queueprocinterval",
        ValueKind::Str,
        Some("daily"),
        false,
        true,
    ),
];

/// Deprecated spellings migrated (with a warning) to their current names.
pub const DEPRECATED: &[(&str, &str)] = &[
    ("minusage", "archiver_threshold1_usage"),
    ("timeout", "archiver_timeout"),
    ("retrytimeout", "archiver_retrytimeout"),
    ("maxretrievers", "retriever_maxworkers"),
    ("remounttime", "retriever_remountdelay"),
];

/// Keys from ancient configurations that no longer have a counterpart.
/// Their presence aborts startup with a pointer at what replaced them.
pub const OBSOLETE: &[(&str, &str)] = &[
    ("minfree", "free-space handling is governed by retriever_buffersize"),
    ("verbose", "set the ENDIT_LOG environment variable instead"),
];

/// Looks up the declaration for `name`.
#[must_use]
pub fn spec_for(name: &str) -> Option<&'static KeySpec> {
    KEYS.iter().find(|spec| spec.name == name)
}

/// Returns the current spelling for a deprecated key, if `name` is one.
#[must_use]
pub fn migrated_name(name: &str) -> Option<&'static str> {
    DEPRECATED
        .iter()
        .find(|(old, _)| *old == name)
        .map(|(_, new)| *new)
}

/// Returns the removal notice for an obsolete key, if `name` is one.
#[must_use]
pub fn obsolete_notice(name: &str) -> Option<&'static str> {
    OBSOLETE
        .iter()
        .find(|(old, _)| *old == name)
        .map(|(_, notice)| *notice)
}
