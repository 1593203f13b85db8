use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::admin::{AdminError, Result};
use crate::qgroup::{BackrefResolver, ExtentScanner, QgroupInfo, QuotaEngine, TimeSeq};
use crate::types::{QgroupId, RootId, RootSet};

const MAX_FINDINGS: usize = 32;

/// Specifies the depth of verification checks to perform.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLevel {
    /// Status and hierarchy checks without reading extents.
    Fast,
    /// Also recomputes every group's totals from the committed extents.
    Full,
}

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Informational message about the verification process.
    Info,
    /// Non-critical issue that may indicate a problem.
    Warning,
    /// Counters or hierarchy are wrong.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// The severity level of this finding.
    pub severity: VerifySeverity,
    /// Human-readable description of the issue.
    pub message: String,
}

impl VerifyFinding {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: VerifySeverity::Warning,
            message: message.into(),
        }
    }
}

/// Statistics collected during the verification process.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// Groups examined.
    pub groups: u64,
    /// Membership edges examined.
    pub relations: u64,
    /// Extent items read from the scanner.
    pub extents_scanned: u64,
    /// Bytes covered by those extents.
    pub bytes_scanned: u64,
    /// Groups whose totals differ from the recomputed ones.
    pub mismatched_groups: u64,
}

/// Complete report of a verification operation.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// The verification level that was performed.
    pub level: VerifyLevel,
    /// Whether verification passed without finding any errors.
    pub success: bool,
    /// List of issues discovered during verification.
    pub findings: Vec<VerifyFinding>,
    /// Statistics about the data structures examined.
    pub counts: VerifyCounts,
}

/// Verifies the quota state of `engine`.
///
/// `Fast` checks the hierarchy and status flags. `Full` additionally walks
/// every committed extent through `scanner`, resolves its owners with
/// `resolver` and compares the resulting totals with the engine's. The
/// comparison assumes no commit runs concurrently; while the counters are
/// flagged inconsistent or a rescan is in progress, mismatches are reported
/// as warnings.
///
/// # Errors
///
/// Returns an error if quota is off or the scanner/resolver fail.
pub fn verify(
    engine: &QuotaEngine,
    scanner: &dyn ExtentScanner,
    resolver: &dyn BackrefResolver,
    level: VerifyLevel,
) -> Result<VerifyReport> {
    let status = engine.status();
    if !status.on {
        return Err(AdminError::Message("quota is not enabled".into()));
    }
    let groups = engine.qgroups();
    let mut findings = Vec::new();
    let mut counts = VerifyCounts {
        groups: groups.len() as u64,
        ..VerifyCounts::default()
    };
    let trusted = !status.inconsistent && !status.rescan;
    if status.rescan {
        push(
            &mut findings,
            VerifyFinding {
                severity: VerifySeverity::Info,
                message: format!("rescan in progress at {:#x}", status.rescan_cursor),
            },
        );
    }
    if status.inconsistent {
        push(
            &mut findings,
            VerifyFinding::warning("counters are flagged inconsistent, totals may lag"),
        );
    }

    check_hierarchy(&groups, &mut findings, &mut counts);

    if matches!(level, VerifyLevel::Full) {
        let extents = collect_extents(scanner, resolver, &mut counts)?;
        let expected = reference_totals(&groups, &extents);
        for group in &groups {
            let (rfer, excl) = expected.get(&group.id).copied().unwrap_or_default();
            if group.counters.rfer == rfer && group.counters.excl == excl {
                continue;
            }
            counts.mismatched_groups += 1;
            let message = format!(
                "qgroup {} holds rfer={} excl={}, extents give rfer={} excl={}",
                group.id, group.counters.rfer, group.counters.excl, rfer, excl
            );
            if trusted {
                push(&mut findings, VerifyFinding::error(message));
            } else {
                push(&mut findings, VerifyFinding::warning(message));
            }
        }
    }

    let success = findings
        .iter()
        .all(|finding| finding.severity != VerifySeverity::Error);
    Ok(VerifyReport {
        level,
        success,
        findings,
        counts,
    })
}

fn check_hierarchy(groups: &[QgroupInfo], findings: &mut Vec<VerifyFinding>, counts: &mut VerifyCounts) {
    let by_id: BTreeMap<QgroupId, &QgroupInfo> =
        groups.iter().map(|group| (group.id, group)).collect();
    for group in groups {
        for parent in &group.parents {
            counts.relations += 1;
            if parent.level <= group.id.level {
                push(
                    findings,
                    VerifyFinding::error(format!(
                        "qgroup {} has parent {} at a level not above it",
                        group.id, parent
                    )),
                );
            }
            match by_id.get(parent) {
                Some(p) if p.members.contains(&group.id) => {}
                Some(_) => push(
                    findings,
                    VerifyFinding::error(format!(
                        "parent {} does not list member {}",
                        parent, group.id
                    )),
                ),
                None => push(
                    findings,
                    VerifyFinding::error(format!(
                        "qgroup {} references missing parent {}",
                        group.id, parent
                    )),
                ),
            }
        }
        if group.counters.excl > group.counters.rfer {
            push(
                findings,
                VerifyFinding::error(format!(
                    "qgroup {} has excl {} above rfer {}",
                    group.id, group.counters.excl, group.counters.rfer
                )),
            );
        }
        if findings.len() >= MAX_FINDINGS {
            break;
        }
    }
}

fn collect_extents(
    scanner: &dyn ExtentScanner,
    resolver: &dyn BackrefResolver,
    counts: &mut VerifyCounts,
) -> Result<Vec<(u64, u64, RootSet)>> {
    let mut extents = Vec::new();
    let mut cursor = 0u64;
    while let Some(leaf) = scanner.next_leaf(cursor)? {
        let Some(last) = leaf.last_bytenr() else {
            break;
        };
        for item in leaf.items {
            let roots = resolver.find_all_roots(item.bytenr, TimeSeq::Live)?;
            counts.extents_scanned += 1;
            counts.bytes_scanned = counts.bytes_scanned.saturating_add(item.num_bytes);
            extents.push((item.bytenr, item.num_bytes, roots));
        }
        if last == u64::MAX {
            break;
        }
        cursor = last + 1;
    }
    Ok(extents)
}

/// Expected `(rfer, excl)` of every group, computed extent by extent from
/// scratch over the membership in `groups`.
pub fn reference_totals(
    groups: &[QgroupInfo],
    extents: &[(u64, u64, RootSet)],
) -> BTreeMap<QgroupId, (u64, u64)> {
    let parents: BTreeMap<QgroupId, &[QgroupId]> = groups
        .iter()
        .map(|group| (group.id, group.parents.as_slice()))
        .collect();
    let closure_of = |root: RootId| -> BTreeSet<QgroupId> {
        let mut seen = BTreeSet::new();
        let start = QgroupId::for_root(root);
        if !parents.contains_key(&start) {
            return seen;
        }
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if seen.insert(id) {
                stack.extend(parents.get(&id).copied().unwrap_or_default());
            }
        }
        seen
    };
    let mut totals: BTreeMap<QgroupId, (u64, u64)> =
        groups.iter().map(|group| (group.id, (0, 0))).collect();
    for (_, num_bytes, roots) in extents {
        let closures: Vec<BTreeSet<QgroupId>> = roots.iter().map(|&r| closure_of(r)).collect();
        for (id, (rfer, excl)) in totals.iter_mut() {
            let hits = closures.iter().filter(|c| c.contains(id)).count();
            if hits > 0 {
                *rfer += num_bytes;
                if hits == roots.len() {
                    *excl += num_bytes;
                }
            }
        }
    }
    totals
}

fn push(findings: &mut Vec<VerifyFinding>, finding: VerifyFinding) {
    if findings.len() < MAX_FINDINGS {
        findings.push(finding);
    }
}
