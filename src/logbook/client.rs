use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder};
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{RunConfig, SearchCriteria};
use crate::error::LogbookError;
use crate::traits::LogbookApi;

use super::html;
use super::types::{Attachment, Credentials, SearchResult, SessionToken};

const LOGIN_FORM_ID: &str = "user_login_block";
const SEARCH_FORM_ID: &str = "elog_form_advanced_filters";
const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";

/// HTTP経由でログブックにアクセスするクライアント
pub struct HttpLogbookClient {
    client: Client,
    jar: Arc<Jar>,
    base_url: Url,
    login_url: Url,
    search_url: Url,
    attachment_extensions: Vec<String>,
    /// 検索フォームの hidden フィールド（初回検索時に一度だけ取得）
    search_form: OnceCell<Vec<(String, String)>>,
}

impl HttpLogbookClient {
    pub fn new(config: &RunConfig) -> Result<Self, LogbookError> {
        let service = &config.service;
        let base_url = Url::parse(&service.base_url).map_err(|e| {
            LogbookError::Configuration(format!("base_url が不正です: {}: {}", service.base_url, e))
        })?;
        let join = |path: &str| {
            base_url.join(path).map_err(|e| {
                LogbookError::Configuration(format!("URLを組み立てられません: {}: {}", path, e))
            })
        };
        let login_url = join(&service.login_path)?;
        let search_url = join(&service.search_path)?;

        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static(ACCEPT_HTML));

        let jar = Arc::new(Jar::default());
        let client = Client::builder()
            .cookie_provider(jar.clone())
            .user_agent(service.user_agent.as_str())
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| LogbookError::Configuration(format!("HTTPクライアント作成エラー: {}", e)))?;

        Ok(Self {
            client,
            jar,
            base_url,
            login_url,
            search_url,
            attachment_extensions: service.attachment_extensions.clone(),
            search_form: OnceCell::new(),
        })
    }

    fn with_session(&self, request: RequestBuilder, session: &SessionToken) -> RequestBuilder {
        if session.is_empty() {
            request
        } else {
            request.header(header::COOKIE, session.as_str())
        }
    }

    /// 検索フォームから form_build_id / form_token を取得
    async fn fetch_search_form(
        &self,
        session: &SessionToken,
    ) -> Result<Vec<(String, String)>, LogbookError> {
        debug!("Fetching search form from {}", self.search_url);

        let response = self
            .with_session(self.client.get(self.search_url.clone()), session)
            .send()
            .await
            .map_err(|e| LogbookError::Search(format!("検索フォーム取得失敗: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LogbookError::Search(format!(
                "検索フォーム取得失敗: HTTP {}",
                status
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| LogbookError::Search(format!("検索フォーム読み込み失敗: {}", e)))?;

        let (Some(build_id), Some(token)) = (
            html::input_value(&body, "form_build_id"),
            html::input_value(&body, "form_token"),
        ) else {
            return Err(LogbookError::Search(
                "検索フォームに form_build_id / form_token がありません".into(),
            ));
        };
        debug!("Search form_build_id={}", build_id);

        Ok(vec![
            ("form_build_id".to_string(), build_id),
            ("form_token".to_string(), token),
            ("form_id".to_string(), SEARCH_FORM_ID.to_string()),
            ("op".to_string(), "Submit".to_string()),
        ])
    }
}

#[async_trait]
impl LogbookApi for HttpLogbookClient {
    async fn login(&self, credentials: &Credentials) -> Result<SessionToken, LogbookError> {
        info!("Logging in to {} as {}", self.base_url, credentials.username);

        let login_page = self
            .client
            .get(self.base_url.clone())
            .send()
            .await
            .map_err(|e| LogbookError::Authentication(format!("サービスに接続できません: {}", e)))?
            .text()
            .await
            .map_err(|e| LogbookError::Authentication(format!("ログインページ読み込み失敗: {}", e)))?;

        let form_build_id = html::input_value(&login_page, "form_build_id");
        match &form_build_id {
            Some(id) => debug!("Login form_build_id={}", id),
            None => warn!("No form_build_id on login page, login may fail"),
        }

        let mut form = vec![
            ("name", credentials.username.as_str()),
            ("pass", credentials.password.as_str()),
            ("form_id", LOGIN_FORM_ID),
            ("op", "Log in"),
        ];
        if let Some(id) = &form_build_id {
            form.push(("form_build_id", id.as_str()));
        }

        let response = self
            .client
            .post(self.login_url.clone())
            .header(header::REFERER, self.base_url.as_str())
            .header(header::ORIGIN, self.base_url.origin().ascii_serialization())
            .form(&form)
            .send()
            .await
            .map_err(|e| LogbookError::Authentication(format!("ログイン要求失敗: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LogbookError::Authentication(format!("ログイン応答読み込み失敗: {}", e)))?;

        if !status.is_success() || !html::is_logged_in(&body) {
            return Err(LogbookError::Authentication(format!(
                "ログインに失敗しました (HTTP {})",
                status
            )));
        }

        let cookies = self
            .jar
            .cookies(&self.base_url)
            .and_then(|value| value.to_str().ok().map(str::to_string))
            .unwrap_or_default();

        info!("Login successful");
        Ok(SessionToken::new(cookies))
    }

    async fn search_page(
        &self,
        session: &SessionToken,
        criteria: &SearchCriteria,
        page: u32,
    ) -> Result<Vec<SearchResult>, LogbookError> {
        let form = self
            .search_form
            .get_or_try_init(|| self.fetch_search_form(session))
            .await?;

        let mut query: Vec<(String, String)> = criteria
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        query.extend(form.iter().cloned());
        query.push(("page".to_string(), page.to_string()));

        info!("Fetching search page {}", page);
        let response = self
            .with_session(self.client.get(self.search_url.clone()).query(&query), session)
            .send()
            .await
            .map_err(|e| LogbookError::Search(format!("ページ {} の取得に失敗: {}", page, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LogbookError::Search(format!(
                "ページ {} の取得に失敗: HTTP {} ({})",
                page,
                status,
                response.url()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| LogbookError::Search(format!("ページ {} の読み込みに失敗: {}", page, e)))?;

        let entries = html::parse_entries(&body, &self.base_url);
        debug!("Page {} has {} entries", page, entries.len());
        Ok(entries)
    }

    async fn attachments(
        &self,
        session: &SessionToken,
        entry: &SearchResult,
    ) -> Result<Vec<Attachment>, LogbookError> {
        if !entry.attachments.is_empty() {
            return Ok(entry.attachments.clone());
        }

        let entry_url = Url::parse(&entry.url).map_err(|e| {
            LogbookError::Download(format!("エントリURLが不正です: {}: {}", entry.url, e))
        })?;

        debug!("Fetching entry page {}", entry_url);
        let response = self
            .with_session(self.client.get(entry_url.clone()), session)
            .send()
            .await
            .map_err(|e| LogbookError::Download(format!("エントリ {} の取得に失敗: {}", entry.id, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LogbookError::Download(format!(
                "エントリ {} の取得に失敗: HTTP {}",
                entry.id, status
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| LogbookError::Download(format!("エントリ {} の読み込みに失敗: {}", entry.id, e)))?;

        Ok(html::attachment_links(&body, &entry_url, &self.attachment_extensions))
    }

    async fn download(
        &self,
        session: &SessionToken,
        attachment: &Attachment,
        dest: &Path,
    ) -> Result<u64, LogbookError> {
        debug!("Downloading {} from {}", attachment.name, attachment.url);

        let response = self
            .with_session(self.client.get(attachment.url.as_str()), session)
            .send()
            .await
            .map_err(|e| LogbookError::Download(format!("{}: {}", attachment.name, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LogbookError::Download(format!(
                "{}: HTTP {}",
                attachment.name, status
            )));
        }

        // 受信しきるまで一時ファイルに書き、既存の完全なファイルを壊さない
        let part = part_path(dest);
        let written = match stream_to_file(response, &part, &attachment.name).await {
            Ok(written) => written,
            Err(e) => {
                remove_part(&part).await;
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&part, dest).await {
            remove_part(&part).await;
            return Err(LogbookError::Download(format!(
                "{} に保存できません: {}",
                dest.display(),
                e
            )));
        }

        Ok(written)
    }
}

/// `<dest>.part`
fn part_path(dest: &Path) -> PathBuf {
    let mut path = dest.as_os_str().to_owned();
    path.push(".part");
    PathBuf::from(path)
}

async fn remove_part(part: &Path) {
    if let Err(e) = tokio::fs::remove_file(part).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove partial file {:?}: {}", part, e);
        }
    }
}

async fn stream_to_file(
    response: reqwest::Response,
    path: &Path,
    name: &str,
) -> Result<u64, LogbookError> {
    let write_error =
        |e: std::io::Error| LogbookError::Download(format!("{} に書き込めません: {}", path.display(), e));

    let mut file = tokio::fs::File::create(path).await.map_err(write_error)?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| LogbookError::Download(format!("{}: {}", name, e)))?;
        file.write_all(&chunk).await.map_err(write_error)?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(write_error)?;

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SEARCH_FORM: &str = r#"<form>
        <input type="hidden" name="form_build_id" value="form-search-1">
        <input type="hidden" name="form_token" value="token-1">
    </form>"#;

    fn client_for(server: &MockServer) -> HttpLogbookClient {
        let config = RunConfig::new(SearchCriteria::new().with("search_str", "NPS"))
            .with_base_url(format!("{}/", server.uri()));
        HttpLogbookClient::new(&config).unwrap()
    }

    #[test]
    fn test_new_rejects_bad_base_url() {
        let config = RunConfig::new(SearchCriteria::new()).with_base_url("not a url");
        assert!(matches!(
            HttpLogbookClient::new(&config),
            Err(LogbookError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_login_success_and_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<input type="hidden" name="form_build_id" value="form-login-1">"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/entries"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Set-Cookie", "SESS1=abc; Path=/")
                    .set_body_string(r#"<a href="/user/logout">Log out</a>"#),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let result = client.login(&Credentials::new("user", "pass")).await;
        assert!(result.is_ok());

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<form></form>"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Sorry, unrecognized username"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let result = client.login(&Credentials::new("user", "wrong")).await;
        assert!(matches!(result, Err(LogbookError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_search_page_sends_form_tokens_and_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/entries"))
            .and(query_param("page", "0"))
            .and(query_param("form_token", "token-1"))
            .and(query_param("search_str", "NPS"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"<a href="/entry/7">COIN_NPS Start_Run_4007</a>"#),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/entries"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SEARCH_FORM))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let criteria = SearchCriteria::new().with("search_str", "NPS");
        let entries = client
            .search_page(&SessionToken::new(""), &criteria, 0)
            .await
            .unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "7");
        assert_eq!(entries[0].url, format!("{}/entry/7", server.uri()));
    }

    #[tokio::test]
    async fn test_search_without_form_token_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/entries"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let result = client
            .search_page(&SessionToken::new(""), &SearchCriteria::new(), 0)
            .await;
        assert!(matches!(result, Err(LogbookError::Search(_))));
    }

    #[tokio::test]
    async fn test_attachments_and_download() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/entry/7"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<a href="/files/nps-vme1.dat">dat</a><a href="/files/run.png">png</a>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/nps-vme1.dat"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"# FA250 Config: a.cnf\n".to_vec()))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let session = SessionToken::new("");
        let entry = SearchResult::new("7", "Run 4007", format!("{}/entry/7", server.uri()));

        let attachments = client.attachments(&session, &entry).await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].name, "nps-vme1.dat");

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nps-vme1.dat");
        let written = client.download(&session, &attachments[0], &dest).await.unwrap();

        assert_eq!(written, 22);
        assert_eq!(std::fs::read(&dest).unwrap(), b"# FA250 Config: a.cnf\n");
    }

    #[tokio::test]
    async fn test_download_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let attachment = Attachment {
            name: "missing.dat".into(),
            url: format!("{}/files/missing.dat", server.uri()),
        };
        let dir = tempfile::tempdir().unwrap();
        let result = client
            .download(&SessionToken::new(""), &attachment, &dir.path().join("missing.dat"))
            .await;

        assert!(matches!(result, Err(LogbookError::Download(_))));
        assert!(!dir.path().join("missing.dat").exists());
    }

    /// Content-Length より短い本文を返して接続を閉じるだけのサーバ
    async fn truncated_body_server(body: &'static str) -> String {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            let head = "HTTP/1.1 200 OK\r\nContent-Length: 1000\r\nConnection: close\r\n\r\n";
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_truncated_download_keeps_previous_file() {
        let base = truncated_body_server("# FA250 Config: new\n").await;
        let config = RunConfig::new(SearchCriteria::new()).with_base_url(format!("{}/", base));
        let client = HttpLogbookClient::new(&config).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nps-vme1.dat");
        std::fs::write(&dest, "previous-good-copy").unwrap();

        let attachment = Attachment {
            name: "nps-vme1.dat".into(),
            url: format!("{}/files/nps-vme1.dat", base),
        };
        let result = client.download(&SessionToken::new(""), &attachment, &dest).await;

        assert!(matches!(result, Err(LogbookError::Download(_))));
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "previous-good-copy");
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_download_replaces_existing_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/nps-vme1.dat"))
            .respond_with(ResponseTemplate::new(200).set_body_string("# FA250 Config: b.cnf\n"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nps-vme1.dat");
        std::fs::write(&dest, "old").unwrap();

        let attachment = Attachment {
            name: "nps-vme1.dat".into(),
            url: format!("{}/files/nps-vme1.dat", server.uri()),
        };
        client.download(&SessionToken::new(""), &attachment, &dest).await.unwrap();

        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "# FA250 Config: b.cnf\n");
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_slow_response_hits_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("late")
                    .set_delay(std::time::Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let config = RunConfig::new(SearchCriteria::new())
            .with_base_url(format!("{}/", server.uri()))
            .with_timeout(std::time::Duration::from_millis(200));
        let client = HttpLogbookClient::new(&config).unwrap();

        let attachment = Attachment {
            name: "slow.dat".into(),
            url: format!("{}/files/slow.dat", server.uri()),
        };
        let dir = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        let result = client
            .download(&SessionToken::new(""), &attachment, &dir.path().join("slow.dat"))
            .await;

        assert!(matches!(result, Err(LogbookError::Download(_))));
        assert!(started.elapsed() < std::time::Duration::from_secs(4));
        assert!(!dir.path().join("slow.dat").exists());

        let result = client.search_page(&SessionToken::new(""), &SearchCriteria::new(), 0).await;
        assert!(matches!(result, Err(LogbookError::Search(_))));
    }
}
