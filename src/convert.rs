//! リプレイ結果のPDFをページごとのPNGに一括変換する外部コマンドのラッパー
//!
//! `<dir>/COIN_NPS_50k_replay_*/` 内のPDFを `pdftoppm` で変換し、ファイル名一覧の順に
//! ページをリネームする。出力が揃っているPDFは変換しない。

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::LogbookError;

pub const DEFAULT_PROGRAM: &str = "pdftoppm";
pub const DEFAULT_CHECK_PROGRAM: &str = "pdfinfo";
pub const DEFAULT_DPI: u32 = 300;
pub const DEFAULT_FOLDER_PREFIX: &str = "COIN_NPS_50k_replay_";
pub const DEFAULT_MIN_FREE_GB: u64 = 10;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ConvertConfig {
    /// PDF → PNG 変換コマンド（`-png -r <dpi> <pdf> <出力接頭辞>` で呼ぶ）
    pub program: String,
    /// 破損確認コマンド（`<pdf>` を引数に呼び、終了コードで判定）
    pub check_program: String,
    pub dpi: u32,
    /// 同時に変換するPDF数
    pub workers: usize,
    /// 対象サブディレクトリ名の接頭辞
    pub folder_prefix: String,
    /// 変換開始に必要な空き容量（バイト）
    pub min_free_bytes: u64,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            check_program: DEFAULT_CHECK_PROGRAM.to_string(),
            dpi: DEFAULT_DPI,
            workers: num_cpus::get(),
            folder_prefix: DEFAULT_FOLDER_PREFIX.to_string(),
            min_free_bytes: DEFAULT_MIN_FREE_GB * GIB,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvertFailure {
    pub pdf: PathBuf,
    pub message: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ConvertReport {
    /// 変換（または確認）に成功したPDF
    pub converted: Vec<PathBuf>,
    /// 出力が揃っていたため変換しなかったPDF
    pub skipped: Vec<PathBuf>,
    pub failures: Vec<ConvertFailure>,
    /// 失敗があった場合のエラーログ
    pub error_log: Option<PathBuf>,
}

enum Outcome {
    Converted(usize),
    Skipped,
}

/// 出力ファイル名一覧（空行は無視）
pub fn read_filenames(path: &Path) -> Result<Vec<String>, LogbookError> {
    let content = fs::read_to_string(path).map_err(|e| {
        LogbookError::Configuration(format!("{} を読み込めません: {}", path.display(), e))
    })?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// 接頭辞に一致するサブディレクトリ内のPDF（ディレクトリ名・ファイル名順）
pub fn find_pdfs(parent_dir: &Path, folder_prefix: &str) -> Result<Vec<PathBuf>, LogbookError> {
    let mut run_dirs: Vec<PathBuf> = fs::read_dir(parent_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(folder_prefix))
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    run_dirs.sort();

    let mut pdfs = Vec::new();
    for dir in run_dirs {
        let mut found: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "pdf"))
            .collect();
        found.sort();
        pdfs.extend(found);
    }
    Ok(pdfs)
}

/// 空き容量が足りなければ変換を始めない
pub fn ensure_disk_space(path: &Path, min_free_bytes: u64) -> Result<u64, LogbookError> {
    let available = fs2::available_space(path)?;
    if available < min_free_bytes {
        return Err(LogbookError::Convert(format!(
            "空き容量不足: {:.2} GB（{:.2} GB 必要）",
            available as f64 / GIB as f64,
            min_free_bytes as f64 / GIB as f64
        )));
    }
    debug!("{:.2} GB free on {:?}", available as f64 / GIB as f64, path);
    Ok(available)
}

/// `page` 番目（0始まり）のページの出力名
fn page_name(names: &[String], page: usize) -> String {
    names
        .get(page)
        .cloned()
        .unwrap_or_else(|| format!("default_page_{}.png", page + 1))
}

fn outputs_exist(dir: &Path, names: &[String]) -> bool {
    !names.is_empty() && names.iter().all(|name| dir.join(name).exists())
}

/// `<prefix>-<n>.png` のページ番号
fn generated_page(file_name: &str, prefix: &str) -> Option<u32> {
    file_name
        .strip_prefix(prefix)?
        .strip_prefix('-')?
        .strip_suffix(".png")?
        .parse()
        .ok()
}

async fn convert_pdf(
    config: &ConvertConfig,
    pdf: &Path,
    names: &[String],
) -> Result<Outcome, LogbookError> {
    let dir = pdf.parent().unwrap_or_else(|| Path::new("."));
    if outputs_exist(dir, names) {
        info!("Skipping already processed PDF: {:?}", pdf);
        return Ok(Outcome::Skipped);
    }

    let stem = pdf
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix = format!(".{}-page", stem);

    let status = Command::new(&config.program)
        .arg("-png")
        .arg("-r")
        .arg(config.dpi.to_string())
        .arg(pdf)
        .arg(dir.join(&prefix))
        .status()
        .await
        .map_err(|e| LogbookError::Convert(format!("{} を起動できません: {}", config.program, e)))?;
    if !status.success() {
        return Err(LogbookError::Convert(format!(
            "{:?} を変換できません（破損の可能性）: {} が {} で終了",
            pdf, config.program, status
        )));
    }

    let mut pages: Vec<(u32, PathBuf)> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let page = generated_page(&entry.file_name().to_string_lossy(), &prefix)?;
            Some((page, entry.path()))
        })
        .collect();
    pages.sort_unstable_by_key(|(page, _)| *page);

    for (index, (_, generated)) in pages.iter().enumerate() {
        tokio::fs::rename(generated, dir.join(page_name(names, index))).await?;
    }
    Ok(Outcome::Converted(pages.len()))
}

async fn check_pdf(config: &ConvertConfig, pdf: &Path) -> Result<Outcome, LogbookError> {
    let output = Command::new(&config.check_program)
        .arg(pdf)
        .output()
        .await
        .map_err(|e| {
            LogbookError::Convert(format!("{} を起動できません: {}", config.check_program, e))
        })?;
    if !output.status.success() {
        return Err(LogbookError::Convert(format!(
            "{:?} を読み込めません（破損の可能性）: {}",
            pdf,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(Outcome::Converted(0))
}

/// 失敗を `[時刻] ERROR: ...` の形で1行ずつ書き出す
fn write_error_log(dir: &Path, failures: &[ConvertFailure]) -> Option<PathBuf> {
    let now = Local::now();
    let path = dir.join(format!("error_log_{}.txt", now.format("%Y-%m-%d_%H-%M-%S")));
    let stamp = now.format("%Y-%m-%d %H:%M:%S");
    let content: String = failures
        .iter()
        .map(|f| format!("[{}] ERROR: {}\n", stamp, f.message))
        .collect();

    match fs::write(&path, content) {
        Ok(()) => Some(path),
        Err(e) => {
            warn!("Failed to write error log {:?}: {}", path, e);
            None
        }
    }
}

async fn run_all<F, Fut>(
    parent_dir: &Path,
    config: &ConvertConfig,
    task: F,
) -> Result<ConvertReport, LogbookError>
where
    F: Fn(PathBuf) -> Fut,
    Fut: std::future::Future<Output = (PathBuf, Result<Outcome, LogbookError>)>,
{
    let pdfs = find_pdfs(parent_dir, &config.folder_prefix)?;
    info!("Processing {} PDFs with {} workers", pdfs.len(), config.workers.max(1));

    let results: Vec<_> = stream::iter(pdfs)
        .map(task)
        .buffer_unordered(config.workers.max(1))
        .collect()
        .await;

    let mut report = ConvertReport::default();
    for (pdf, result) in results {
        match result {
            Ok(Outcome::Converted(pages)) => {
                debug!("Processed {:?} ({} pages)", pdf, pages);
                report.converted.push(pdf);
            }
            Ok(Outcome::Skipped) => report.skipped.push(pdf),
            Err(e) => {
                warn!("{}", e);
                report.failures.push(ConvertFailure {
                    pdf,
                    message: e.to_string(),
                });
            }
        }
    }
    report.converted.sort();
    report.skipped.sort();
    report.failures.sort_by(|a, b| a.pdf.cmp(&b.pdf));

    if !report.failures.is_empty() {
        report.error_log = write_error_log(parent_dir, &report.failures);
    }
    Ok(report)
}

/// 全PDFを並列に変換する。空き容量不足なら何もせずエラー
pub async fn convert_all(
    parent_dir: &Path,
    names: &[String],
    config: &ConvertConfig,
) -> Result<ConvertReport, LogbookError> {
    ensure_disk_space(parent_dir, config.min_free_bytes)?;
    run_all(parent_dir, config, |pdf| async move {
        let result = convert_pdf(config, &pdf, names).await;
        (pdf, result)
    })
    .await
}

/// 変換せずに全PDFが読めるかだけを確認する
pub async fn check_all(
    parent_dir: &Path,
    config: &ConvertConfig,
) -> Result<ConvertReport, LogbookError> {
    run_all(parent_dir, config, |pdf| async move {
        let result = check_pdf(config, &pdf).await;
        (pdf, result)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replay_dir(parent: &Path, run: u32, pdfs: &[&str]) -> PathBuf {
        let dir = parent.join(format!("{}{}", DEFAULT_FOLDER_PREFIX, run));
        fs::create_dir_all(&dir).unwrap();
        for pdf in pdfs {
            fs::write(dir.join(pdf), b"%PDF-1.4").unwrap();
        }
        dir
    }

    fn config_with(program: &str) -> ConvertConfig {
        ConvertConfig {
            program: program.to_string(),
            check_program: program.to_string(),
            workers: 2,
            min_free_bytes: 0,
            ..Default::default()
        }
    }

    /// 2ページ分の PNG を出力する変換コマンドの代役
    #[cfg(unix)]
    fn fake_converter(dir: &Path) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-pdftoppm");
        fs::write(&path, "#!/bin/sh\ntouch \"$5-1.png\" \"$5-2.png\"\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_read_filenames_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.txt");
        fs::write(&path, "hms_dc.png\n\n  shms_dc.png  \n").unwrap();

        assert_eq!(read_filenames(&path).unwrap(), vec!["hms_dc.png", "shms_dc.png"]);
        assert!(matches!(
            read_filenames(&dir.path().join("missing.txt")),
            Err(LogbookError::Configuration(_))
        ));
    }

    #[test]
    fn test_find_pdfs_only_in_replay_folders() {
        let dir = tempfile::tempdir().unwrap();
        replay_dir(dir.path(), 4002, &["b.pdf", "a.pdf", "notes.txt"]);
        replay_dir(dir.path(), 4001, &["z.pdf"]);
        fs::create_dir_all(dir.path().join("other")).unwrap();
        fs::write(dir.path().join("other/x.pdf"), b"").unwrap();

        let names: Vec<String> = find_pdfs(dir.path(), DEFAULT_FOLDER_PREFIX)
            .unwrap()
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "COIN_NPS_50k_replay_4001/z.pdf",
                "COIN_NPS_50k_replay_4002/a.pdf",
                "COIN_NPS_50k_replay_4002/b.pdf",
            ]
        );
    }

    #[test]
    fn test_generated_page_and_names() {
        assert_eq!(generated_page(".run-page-1.png", ".run-page"), Some(1));
        assert_eq!(generated_page(".run-page-07.png", ".run-page"), Some(7));
        assert_eq!(generated_page(".run-page-1.ppm", ".run-page"), None);
        assert_eq!(generated_page("hms.png", ".run-page"), None);

        let names = vec!["hms.png".to_string()];
        assert_eq!(page_name(&names, 0), "hms.png");
        assert_eq!(page_name(&names, 1), "default_page_2.png");
    }

    #[tokio::test]
    async fn test_insufficient_disk_space_aborts() {
        let dir = tempfile::tempdir().unwrap();
        replay_dir(dir.path(), 4001, &["a.pdf"]);
        let config = ConvertConfig {
            min_free_bytes: u64::MAX,
            ..config_with("definitely-not-a-real-converter")
        };

        let result = convert_all(dir.path(), &[], &config).await;
        assert!(matches!(result, Err(LogbookError::Convert(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_convert_renames_pages_and_skips_done() {
        let dir = tempfile::tempdir().unwrap();
        let tools = tempfile::tempdir().unwrap();
        let run_dir = replay_dir(dir.path(), 4001, &["replay.pdf"]);
        let names = vec!["hms_dc.png".to_string()];
        let config = config_with(&fake_converter(tools.path()));

        let report = convert_all(dir.path(), &names, &config).await.unwrap();
        assert_eq!(report.converted, vec![run_dir.join("replay.pdf")]);
        assert!(report.failures.is_empty());
        assert!(run_dir.join("hms_dc.png").exists());
        assert!(run_dir.join("default_page_2.png").exists());
        assert!(!run_dir.join(".replay-page-1.png").exists());

        let config = config_with("false");
        let report = convert_all(dir.path(), &names, &config).await.unwrap();
        assert_eq!(report.skipped, vec![run_dir.join("replay.pdf")]);
        assert!(report.failures.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failures_are_isolated_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        replay_dir(dir.path(), 4001, &["a.pdf", "b.pdf"]);
        replay_dir(dir.path(), 4002, &["c.pdf"]);

        let report = check_all(dir.path(), &config_with("false")).await.unwrap();
        assert_eq!(report.failures.len(), 3);
        assert!(report.converted.is_empty());

        let log = fs::read_to_string(report.error_log.unwrap()).unwrap();
        assert_eq!(log.lines().count(), 3);
        assert!(log.lines().all(|line| line.contains("] ERROR: ")));

        let report = check_all(dir.path(), &config_with("true")).await.unwrap();
        assert_eq!(report.converted.len(), 3);
        assert!(report.error_log.is_none());
    }

    #[tokio::test]
    async fn test_missing_converter_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        replay_dir(dir.path(), 4001, &["a.pdf"]);

        let report = convert_all(dir.path(), &[], &config_with("definitely-not-a-real-converter"))
            .await
            .unwrap();
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].message.contains("definitely-not-a-real-converter"));
    }
}
