use serde::{Deserialize, Serialize};

/// Snapshot retention rules, applied with `forget --prune` after a
/// successful backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub enabled: bool,
    pub keep_last: u32,
    pub keep_daily: u32,
    pub keep_weekly: u32,
    pub keep_monthly: u32,
    pub keep_yearly: u32,
    /// Floor for `keep_last`, so pruning never leaves fewer snapshots
    pub min_snapshots: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            keep_last: 0,
            keep_daily: 7,
            keep_weekly: 4,
            keep_monthly: 12,
            keep_yearly: 0,
            min_snapshots: 3,
        }
    }
}

impl RetentionPolicy {
    pub fn to_forget_args(&self) -> Vec<String> {
        let keep_last = self.keep_last.max(self.min_snapshots);
        let mut args = Vec::new();
        for (flag, value) in [
            ("--keep-last", keep_last),
            ("--keep-daily", self.keep_daily),
            ("--keep-weekly", self.keep_weekly),
            ("--keep-monthly", self.keep_monthly),
            ("--keep-yearly", self.keep_yearly),
        ] {
            if value > 0 {
                args.push(flag.to_string());
                args.push(value.to_string());
            }
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_last_is_raised_to_minimum() {
        let policy = RetentionPolicy {
            keep_last: 1,
            keep_daily: 0,
            keep_weekly: 0,
            keep_monthly: 0,
            min_snapshots: 3,
            ..Default::default()
        };
        assert_eq!(policy.to_forget_args(), vec!["--keep-last", "3"]);
    }

    #[test]
    fn zero_rules_are_omitted() {
        let args = RetentionPolicy::default().to_forget_args();
        assert_eq!(
            args,
            vec![
                "--keep-last",
                "3",
                "--keep-daily",
                "7",
                "--keep-weekly",
                "4",
                "--keep-monthly",
                "12"
            ]
        );
    }
}
