//! ランごとのメタデータファイルから状態フィールドを抽出し、値ごとの CSV 一覧を作る
//!
//! `<dir>/COIN_NPS_Start_Run_4001/nps-vme1.dat` の `# FA250 Config: <path>` 行を読み、
//! 同じ設定のラン番号をまとめて `FA250_Config_<設定名>.csv` に書き出す。

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, info};

use crate::error::LogbookError;

pub const DEFAULT_FIELD: &str = "FA250 Config";
pub const DEFAULT_FILE_NAME: &str = "nps-vme1.dat";
pub const DEFAULT_FOLDER_PREFIX: &str = "COIN_NPS_Start_Run_";

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// 抽出するフィールド名（`# <field>:` 行）
    pub field: String,
    /// 各ランフォルダ内のメタデータファイル名
    pub file_name: String,
    /// ランフォルダ名の接頭辞（後ろにラン番号が続く）
    pub folder_prefix: String,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            field: DEFAULT_FIELD.to_string(),
            file_name: DEFAULT_FILE_NAME.to_string(),
            folder_prefix: DEFAULT_FOLDER_PREFIX.to_string(),
        }
    }
}

/// 書き出した CSV 1件
#[derive(Debug, Clone)]
pub struct ConfigListing {
    pub value: String,
    pub path: PathBuf,
    pub runs: usize,
}

/// メタデータファイルから `# <field>:` 行の値を読む（最初の該当行のみ）
pub fn read_field(path: &Path, field: &str) -> Result<Option<String>, LogbookError> {
    let bytes = fs::read(path)?;
    let content = String::from_utf8_lossy(&bytes);
    let marker = format!("# {}:", field);

    Ok(content
        .lines()
        .find(|line| line.starts_with(&marker))
        .and_then(|line| line.rsplit(": ").next())
        .map(|value| value.trim().to_string()))
}

/// ランフォルダを走査し、フィールド値ごとにラン番号をまとめる（番号順・重複なし）
pub fn collect_groups(
    metadata_dir: &Path,
    options: &ExtractOptions,
) -> Result<BTreeMap<String, Vec<u32>>, LogbookError> {
    let pattern = Regex::new(&format!(r"^{}(\d+)", regex::escape(&options.folder_prefix)))
        .map_err(|e| LogbookError::Configuration(format!("フォルダ接頭辞が不正です: {}", e)))?;

    let mut groups: BTreeMap<String, Vec<u32>> = BTreeMap::new();

    for dir_entry in fs::read_dir(metadata_dir)? {
        let dir_entry = dir_entry?;
        let folder = dir_entry.file_name();
        let folder = folder.to_string_lossy();

        let Some(run) = pattern
            .captures(&folder)
            .and_then(|c| c[1].parse::<u32>().ok())
        else {
            continue;
        };

        let file_path = dir_entry.path().join(&options.file_name);
        if !file_path.is_file() {
            debug!("Skipping run {}: {:?} not found", run, file_path);
            continue;
        }

        match read_field(&file_path, &options.field)? {
            Some(value) => groups.entry(value).or_default().push(run),
            None => debug!("Skipping run {}: no '{}' line", run, options.field),
        }
    }

    for runs in groups.values_mut() {
        runs.sort_unstable();
        runs.dedup();
    }
    Ok(groups)
}

/// ファイル名に使えるよう `/` `.` 空白を `_` に置き換える
pub fn sanitize_name(value: &str) -> String {
    value.replace(['/', '.', ' '], "_")
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// グループごとに `<field>_<value>.csv` を書き出す
pub fn write_group_csvs(
    groups: &BTreeMap<String, Vec<u32>>,
    output_dir: &Path,
    field: &str,
) -> Result<Vec<ConfigListing>, LogbookError> {
    fs::create_dir_all(output_dir)?;

    let mut listings = Vec::with_capacity(groups.len());
    for (value, runs) in groups {
        let path = output_dir.join(format!("{}_{}.csv", sanitize_name(field), sanitize_name(value)));

        let mut content = format!("Run Number,{}\n", csv_field(field));
        for run in runs {
            content.push_str(&format!("{},{}\n", run, csv_field(value)));
        }
        fs::write(&path, content)?;

        info!("Saved: {:?} ({} runs)", path, runs.len());
        listings.push(ConfigListing {
            value: value.clone(),
            path,
            runs: runs.len(),
        });
    }
    Ok(listings)
}

/// 走査と書き出しをまとめて実行
pub fn extract(
    metadata_dir: &Path,
    output_dir: &Path,
    options: &ExtractOptions,
) -> Result<Vec<ConfigListing>, LogbookError> {
    let groups = collect_groups(metadata_dir, options)?;
    info!(
        "Found {} distinct '{}' values in {:?}",
        groups.len(),
        options.field,
        metadata_dir
    );
    write_group_csvs(&groups, output_dir, &options.field)
}
