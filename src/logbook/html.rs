//! ログブックHTMLからの抽出処理
//!
//! 対象ページはフォーム・表・リンクだけを使う単純な構造なので、正規表現で必要な部分を取り出す。

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use super::types::{Attachment, SearchResult};

static INPUT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<input\b([^>]*)>").unwrap());
static ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)([A-Za-z_:][-A-Za-z0-9_:.\[\]]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .unwrap()
});
static ANCHOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<a\b([^>]*)>(.*?)</a>").unwrap());
static ROW_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<tr\b[^>]*>(.*?)</tr>").unwrap());
static CELL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<td\b([^>]*)>(.*?)</td>").unwrap());
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static ENTRY_HREF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:https?://[^/]+)?/entry/(\d+)").unwrap());
static FIELD_CLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"views-field-([A-Za-z0-9_-]+)").unwrap());

/// タグ属性を (名前, 値) の列で返す。名前は小文字化する
fn attributes(attrs: &str) -> Vec<(String, String)> {
    ATTR_RE
        .captures_iter(attrs)
        .map(|c| {
            let value = c
                .get(2)
                .or_else(|| c.get(3))
                .or_else(|| c.get(4))
                .map(|m| m.as_str())
                .unwrap_or_default();
            (c[1].to_ascii_lowercase(), unescape(value))
        })
        .collect()
}

fn attribute<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn unescape(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#039;", "'")
        .replace("&amp;", "&")
}

/// タグを除去し、空白を1つにまとめる
pub fn strip_tags(s: &str) -> String {
    let text = TAG_RE.replace_all(s, " ");
    unescape(&text).split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `<input name="...">` の value を取得（hidden の form_build_id / form_token など）
pub fn input_value(html: &str, name: &str) -> Option<String> {
    INPUT_RE.captures_iter(html).find_map(|c| {
        let attrs = attributes(&c[1]);
        if attribute(&attrs, "name") == Some(name) {
            attribute(&attrs, "value").map(str::to_string)
        } else {
            None
        }
    })
}

/// ログイン後のページか（ログアウトリンクの有無）
pub fn is_logged_in(html: &str) -> bool {
    html.to_lowercase().contains("logout")
}

fn resolve_url(base: &Url, href: &str) -> String {
    base.join(href)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

/// (エントリ番号, href, タイトル) を返す
fn entry_links(html: &str) -> impl Iterator<Item = (String, String, String)> + '_ {
    ANCHOR_RE.captures_iter(html).filter_map(|c| {
        let attrs = attributes(&c[1]);
        let href = attribute(&attrs, "href")?;
        let id = ENTRY_HREF_RE.captures(href)?[1].to_string();
        let title = strip_tags(&c[2]);
        if title.is_empty() {
            return None;
        }
        Some((id, href.to_string(), title))
    })
}

/// セルの class（`views-field-<name>`）からフィールド名を得る
fn cell_field_name(cell_attrs: &str) -> Option<String> {
    let attrs = attributes(cell_attrs);
    let class = attribute(&attrs, "class")?;
    FIELD_CLASS_RE
        .captures(class)
        .map(|c| c[1].replace('-', "_"))
}

/// 検索結果ページからエントリを抽出する
///
/// 表形式の一覧では同じ行のセル（`views-field-<name>`）をフィールドとして取り込む。
/// 表の外にあるエントリリンクはタイトルのみで追加する。順序はページ上の出現順。
pub fn parse_entries(html: &str, base: &Url) -> Vec<SearchResult> {
    let mut results = Vec::new();
    let mut seen = HashSet::new();

    for row in ROW_RE.captures_iter(html) {
        let body = &row[1];
        // タイトル列のリンクを優先する
        let title_link = CELL_RE
            .captures_iter(body)
            .find(|cell| cell_field_name(&cell[1]).as_deref() == Some("title"))
            .and_then(|cell| {
                let link = entry_links(cell.get(2)?.as_str()).next();
                link
            });
        let Some((id, href, title)) = title_link.or_else(|| entry_links(body).next()) else {
            continue;
        };
        if !seen.insert(id.clone()) {
            continue;
        }

        let mut result = SearchResult::new(id, title, resolve_url(base, &href));
        for cell in CELL_RE.captures_iter(body) {
            let Some(name) = cell_field_name(&cell[1]) else {
                continue;
            };
            if name == "title" {
                continue;
            }
            result.fields.insert(name, strip_tags(&cell[2]));
        }
        results.push(result);
    }

    for (id, href, title) in entry_links(html) {
        if seen.insert(id.clone()) {
            results.push(SearchResult::new(id, title, resolve_url(base, &href)));
        }
    }

    results
}

/// エントリページから指定拡張子の添付ファイルリンクを抽出する
pub fn attachment_links(html: &str, base: &Url, extensions: &[String]) -> Vec<Attachment> {
    let mut seen = HashSet::new();
    let links = ANCHOR_RE
        .captures_iter(html)
        .filter_map(|c| {
            let attrs = attributes(&c[1]);
            let href = attribute(&attrs, "href")?;
            let url = base.join(href).ok()?;
            if !extensions.iter().any(|ext| url.path().ends_with(ext.as_str())) {
                return None;
            }
            let name = attachment_name(&url)?;
            seen.insert(url.to_string())
                .then(|| Attachment { name, url: url.to_string() })
        })
        .collect();
    links
}

/// URL末尾のパスセグメント（パーセントデコード済み）
pub fn attachment_name(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.last()?;
    if segment.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    Some(decoded)
}
