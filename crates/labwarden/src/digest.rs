//! Owner digests.
//!
//! Every notice the engine produced for one server is folded into a single
//! markdown message per owner identity.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use notify::Identity;

use crate::engine::{Notice, NoticeKind, TerminationOutcome};

const FOOTER: &str = "Please consider using the ***\"VIRL stop lab\"*** or \
***\"VIRL delete lab\"*** commands to free server resources, or \
***\"VIRL extend lab\"*** if you still need a lab.\n\n\
Type \"help\" to see how I can assist you";

/// One outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    pub server_id: String,
    pub identity: Identity,
    pub owner_key: String,
    pub lines: Vec<String>,
}

impl Digest {
    /// Markdown body sent to the owner.
    #[must_use]
    pub fn render(&self) -> String {
        let mut body = format!(
            "You have running lab(s) on VIRL server {}\n\n",
            self.server_id
        );
        for line in &self.lines {
            body.push_str(line);
            body.push('\n');
        }
        body.push('\n');
        body.push_str(FOOTER);
        body
    }
}

/// Group notices into one digest per identity, in identity order. Lines keep
/// the order the notices were produced in.
#[must_use]
pub fn compose(server_id: &str, notices: &[Notice]) -> Vec<Digest> {
    let mut by_identity: BTreeMap<&Identity, Digest> = BTreeMap::new();
    for notice in notices {
        by_identity
            .entry(&notice.identity)
            .or_insert_with(|| Digest {
                server_id: server_id.to_string(),
                identity: notice.identity.clone(),
                owner_key: notice.owner_key.clone(),
                lines: Vec::new(),
            })
            .lines
            .push(notice_line(notice));
    }
    by_identity.into_values().collect()
}

fn notice_line(notice: &Notice) -> String {
    let lab = &notice.lab_id;
    match &notice.kind {
        NoticeKind::NewWarning { age_secs } => {
            format!(" - Lab **{lab}** has been running for {}", format_duration(*age_secs))
        }
        NoticeKind::RenewalExpired { age_secs } => format!(
            " - Lab **{lab}** extension has ended, it has been running for {}",
            format_duration(*age_secs)
        ),
        NoticeKind::Countdown { remaining_secs } => format!(
            " - Lab **{lab}** will be deleted in {} unless it is extended",
            format_duration(*remaining_secs)
        ),
        NoticeKind::Terminated { age_secs, outcome } => {
            let age = format_duration(*age_secs);
            match outcome {
                TerminationOutcome::Reclaimed => {
                    format!(" - Lab **{lab}** was deleted after running for {age}")
                }
                TerminationOutcome::Failed { step, .. } => format!(
                    " - Lab **{lab}** reached its deletion deadline after {age} but could not \
                     be deleted ({step} failed), please delete it yourself"
                ),
                TerminationOutcome::Untracked => format!(
                    " - Lab **{lab}** reached its deletion deadline after {age} and is no \
                     longer tracked, please delete it yourself"
                ),
            }
        }
    }
}

/// Render seconds as days, hours, minutes and seconds, using floor division.
///
/// ```
/// assert_eq!(
///     labwarden::digest::format_duration(90_061),
///     "1 day 1 hour 1 minute 1 second"
/// );
/// ```
#[must_use]
pub fn format_duration(secs: u64) -> String {
    let parts = [
        (secs / 86_400, "day"),
        ((secs % 86_400) / 3_600, "hour"),
        ((secs % 3_600) / 60, "minute"),
        (secs % 60, "second"),
    ];

    let mut out = String::new();
    for (count, unit) in parts {
        if !out.is_empty() {
            out.push(' ');
        }
        let plural = if count == 1 { "" } else { "s" };
        let _ = write!(out, "{count} {unit}{plural}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TerminationStep;

    fn notice(owner: &str, lab: &str, kind: NoticeKind) -> Notice {
        Notice {
            identity: Identity::new(format!("id-{owner}")),
            owner_key: owner.to_string(),
            lab_id: lab.to_string(),
            kind,
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(90_061), "1 day 1 hour 1 minute 1 second");
        assert_eq!(
            format_duration(200_000),
            "2 days 7 hours 33 minutes 20 seconds"
        );
        assert_eq!(format_duration(0), "0 days 0 hours 0 minutes 0 seconds");
        assert_eq!(format_duration(86_399), "0 days 23 hours 59 minutes 59 seconds");
    }

    #[test]
    fn test_one_digest_per_identity() {
        let notices = vec![
            notice("bob@x", "lab-1", NoticeKind::NewWarning { age_secs: 200_000 }),
            notice("ann@x", "lab-2", NoticeKind::Countdown { remaining_secs: 90_061 }),
            notice("bob@x", "lab-3", NoticeKind::RenewalExpired { age_secs: 60 }),
        ];
        let digests = compose("virl-1", &notices);

        assert_eq!(digests.len(), 2);
        assert_eq!(digests[0].owner_key, "ann@x");
        assert_eq!(digests[1].owner_key, "bob@x");
        assert_eq!(digests[1].lines.len(), 2);
        assert!(digests[1].lines[0].contains("lab-1"));
        assert!(digests[1].lines[1].contains("lab-3"));
    }

    #[test]
    fn test_no_notices_no_digests() {
        assert!(compose("virl-1", &[]).is_empty());
    }

    #[test]
    fn test_render() {
        let digests = compose(
            "virl-1",
            &[notice("ann@x", "lab-a", NoticeKind::NewWarning { age_secs: 200_000 })],
        );
        let body = digests[0].render();

        assert!(body.starts_with("You have running lab(s) on VIRL server virl-1"));
        assert!(body.contains(
            "Lab **lab-a** has been running for 2 days 7 hours 33 minutes 20 seconds"
        ));
        assert!(body.ends_with("Type \"help\" to see how I can assist you"));
    }

    #[test]
    fn test_termination_wording_differs_on_failure() {
        let ok = notice_line(&notice(
            "ann@x",
            "lab-a",
            NoticeKind::Terminated {
                age_secs: 10,
                outcome: TerminationOutcome::Reclaimed,
            },
        ));
        let failed = notice_line(&notice(
            "ann@x",
            "lab-a",
            NoticeKind::Terminated {
                age_secs: 10,
                outcome: TerminationOutcome::Failed {
                    step: TerminationStep::Wipe,
                    error: "API error: 500 - boom".to_string(),
                },
            },
        ));

        assert!(ok.contains("was deleted"));
        assert!(failed.contains("could not be deleted (wipe failed)"));
        assert!(!failed.contains("boom"));
    }
}
