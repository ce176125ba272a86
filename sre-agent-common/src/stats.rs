// ABOUTME: folds incident records into outcome counts, a risk histogram, and a daily series.
// ABOUTME: pure over its input so any ledger backend can reuse it.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::IncidentRecord;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IncidentStats {
    pub window_days: u32,
    pub total_incidents: u64,
    /// Safe commands that took the automatic path.
    pub auto_executed: u64,
    /// Commands run after a human approval.
    pub manually_executed: u64,
    /// Commands that failed policy evaluation.
    pub blocked: u64,
    /// Safe commands still waiting for a human.
    pub pending: u64,
    pub risk_distribution: BTreeMap<String, u64>,
    pub daily_counts: Vec<DailyCount>,
}

impl IncidentStats {
    pub fn from_records<'a>(
        records: impl IntoIterator<Item = &'a IncidentRecord>,
        since: DateTime<Utc>,
        window_days: u32,
    ) -> Self {
        let mut stats = IncidentStats {
            window_days,
            ..Default::default()
        };
        let mut daily: BTreeMap<NaiveDate, u64> = BTreeMap::new();

        for record in records.into_iter().filter(|r| r.timestamp >= since) {
            stats.total_incidents += 1;

            if !record.safe {
                stats.blocked += 1;
            } else if record.auto_executed {
                stats.auto_executed += 1;
            } else if record.executed {
                stats.manually_executed += 1;
            } else {
                stats.pending += 1;
            }

            *stats
                .risk_distribution
                .entry(record.risk_level.as_str().to_string())
                .or_default() += 1;
            *daily.entry(record.timestamp.date_naive()).or_default() += 1;
        }

        stats.daily_counts = daily
            .into_iter()
            .map(|(date, count)| DailyCount { date, count })
            .collect();
        stats
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::{NewIncident, RiskLevel};

    fn record(id: u64, ts: DateTime<Utc>, safe: bool, auto: bool, executed: bool) -> IncidentRecord {
        let mut record = IncidentRecord::open(
            id,
            ts,
            NewIncident {
                log_line: format!("ERROR line {id}"),
                command: "df -h".to_string(),
                auto_executed: auto,
                safe,
                risk_level: if safe { RiskLevel::Low } else { RiskLevel::Critical },
                block_reason: None,
            },
        );
        record.executed = executed;
        record
    }

    #[test]
    fn counts_each_incident_in_exactly_one_outcome() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let records = vec![
            record(1, now, false, true, false),
            record(2, now, true, true, true),
            record(3, now - Duration::days(1), true, false, true),
            record(4, now - Duration::days(1), true, false, false),
            record(5, now - Duration::days(30), true, false, false),
        ];

        let stats = IncidentStats::from_records(&records, now - Duration::days(7), 7);

        assert_eq!(stats.total_incidents, 4);
        assert_eq!(stats.blocked, 1);
        assert_eq!(stats.auto_executed, 1);
        assert_eq!(stats.manually_executed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.risk_distribution.get("CRITICAL"), Some(&1));
        assert_eq!(stats.risk_distribution.get("LOW"), Some(&3));
        assert_eq!(
            stats.daily_counts,
            vec![
                DailyCount {
                    date: NaiveDate::from_ymd_opt(2026, 3, 9).unwrap(),
                    count: 2
                },
                DailyCount {
                    date: NaiveDate::from_ymd_opt(2026, 3, 10).unwrap(),
                    count: 2
                },
            ]
        );
    }
}
