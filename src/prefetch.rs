//! テープ上の生データをキャッシュディスクへ事前取得する外部コマンドのラッパー

use serde::Serialize;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::LogbookError;

pub const DEFAULT_PROGRAM: &str = "jcache";
pub const DEFAULT_RETENTION_DAYS: u32 = 60;
pub const DEFAULT_PATH_TEMPLATE: &str = "/mss/hallc/c-nps/raw/nps_coin_{run}.dat";

#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    pub program: String,
    /// キャッシュ保持日数
    pub retention_days: u32,
    /// `{run}` をラン番号に置き換えたものを取得対象パスとする
    pub path_template: String,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            retention_days: DEFAULT_RETENTION_DAYS,
            path_template: DEFAULT_PATH_TEMPLATE.to_string(),
        }
    }
}

impl PrefetchConfig {
    pub fn args_for(&self, run: u32) -> Vec<String> {
        vec![
            "get".to_string(),
            "-D".to_string(),
            self.retention_days.to_string(),
            self.path_template.replace("{run}", &run.to_string()),
        ]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PrefetchFailure {
    pub run: u32,
    pub message: String,
}

#[derive(Debug, Default, Serialize)]
pub struct PrefetchReport {
    pub requested: Vec<u32>,
    pub failures: Vec<PrefetchFailure>,
}

/// ラン番号ごとにコマンドを1回ずつ順に実行する。失敗は記録して次へ進む
pub async fn prefetch_runs(config: &PrefetchConfig, runs: &[u32]) -> PrefetchReport {
    let mut report = PrefetchReport::default();

    for &run in runs {
        let args = config.args_for(run);
        info!("Requesting run {}: {} {}", run, config.program, args.join(" "));

        let result = match Command::new(&config.program).args(&args).status().await {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(LogbookError::Prefetch(format!(
                "run {}: {} が終了コード {} で失敗しました",
                run, config.program, status
            ))),
            Err(e) => Err(LogbookError::Prefetch(format!(
                "run {}: {} を起動できません: {}",
                run, config.program, e
            ))),
        };

        match result {
            Ok(()) => report.requested.push(run),
            Err(e) => {
                warn!("{}", e);
                report.failures.push(PrefetchFailure {
                    run,
                    message: e.to_string(),
                });
            }
        }
    }

    report
}

/// `4001` または `4001-4010`（両端含む）を展開する
pub fn parse_run_spec(spec: &str) -> Result<Vec<u32>, String> {
    let parse = |s: &str| {
        s.trim()
            .parse::<u32>()
            .map_err(|e| format!("invalid run number {:?}: {}", s, e))
    };

    match spec.split_once('-') {
        Some((start, end)) => {
            let (start, end) = (parse(start)?, parse(end)?);
            if start > end {
                return Err(format!("invalid run range {:?}: start is after end", spec));
            }
            Ok((start..=end).collect())
        }
        None => Ok(vec![parse(spec)?]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_for() {
        let config = PrefetchConfig::default();
        assert_eq!(
            config.args_for(4001),
            vec!["get", "-D", "60", "/mss/hallc/c-nps/raw/nps_coin_4001.dat"]
        );
    }

    #[test]
    fn test_parse_run_spec() {
        assert_eq!(parse_run_spec("4001"), Ok(vec![4001]));
        assert_eq!(parse_run_spec("4001-4003"), Ok(vec![4001, 4002, 4003]));
        assert!(parse_run_spec("4003-4001").is_err());
        assert!(parse_run_spec("abc").is_err());
        assert!(parse_run_spec("").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_prefetch_records_failures_and_continues() {
        let ok = PrefetchConfig {
            program: "true".to_string(),
            ..Default::default()
        };
        let report = prefetch_runs(&ok, &[4001, 4002]).await;
        assert_eq!(report.requested, vec![4001, 4002]);
        assert!(report.failures.is_empty());

        let failing = PrefetchConfig {
            program: "false".to_string(),
            ..Default::default()
        };
        let report = prefetch_runs(&failing, &[4001, 4002]).await;
        assert!(report.requested.is_empty());
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[1].run, 4002);
    }

    #[tokio::test]
    async fn test_prefetch_missing_program() {
        let config = PrefetchConfig {
            program: "definitely-not-a-real-cache-command".to_string(),
            ..Default::default()
        };
        let report = prefetch_runs(&config, &[4001]).await;
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].message.contains("4001"));
    }
}
