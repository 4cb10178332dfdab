use reqwest::Client;
use serde::Serialize;

use crate::error::{DbError, Result};
use crate::table::{Record, RecordKey};

pub const DEFAULT_SERVER_URL: &str = "https://felixchenier.uqam.ca/db";

const ENDPOINT: &str = "mosa/dbinterface.php";
const INVALID_CREDENTIALS: &str = "# INVALID USER/PASSWORD COMBINATION";

/// Operations the reconciliation core needs from the remote database.
pub trait RecordService {
    /// Every entry of the project.
    fn fetch_all(&self) -> Result<Vec<Record>>;

    /// Entries matching the full key. More than one is a server-side anomaly.
    fn find(&self, key: &RecordKey) -> Result<Vec<Record>>;

    /// Create an entry. Inserting an existing key is a no-op on the server.
    fn insert_record(&self, key: &RecordKey) -> Result<()>;

    fn delete_record(&self, key: &RecordKey) -> Result<()>;

    fn find_by_id(&self, id: u64) -> Result<Option<Record>> {
        let mut matches: Vec<Record> = self
            .fetch_all()?
            .into_iter()
            .filter(|r| r.id == id)
            .collect();
        if matches.len() > 1 {
            return Err(DbError::Ambiguous(format!("file id {id}")));
        }
        Ok(matches.pop())
    }
}

#[derive(Clone)]
pub struct MosaClient {
    client: Client,
    base_url: String,
    project: String,
    username: String,
    password: String,
}

#[derive(Serialize)]
struct Form<'a> {
    username: &'a str,
    password: &'a str,
    project: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    participant: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trial: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<&'a str>,
    action: &'a str,
}

impl MosaClient {
    pub fn new(base_url: &str, project: &str, username: &str, password: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("mosa/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            project: project.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    async fn post(&self, key: Option<&RecordKey>, action: &str) -> Result<String> {
        let url = format!("{}/{}", self.base_url, ENDPOINT);
        let form = Form {
            username: &self.username,
            password: &self.password,
            project: &self.project,
            participant: key.map(|k| k.participant.as_str()),
            session: key.map(|k| k.session.as_str()),
            trial: key.map(|k| k.trial.as_str()),
            file: key.map(|k| k.file_type.as_str()),
            action,
        };

        log::debug!("Request URL: {} (action: {})", url, action);

        let res = self.client.post(&url).form(&form).send().await?;

        let status = res.status();
        let bytes = res.bytes().await?;
        let text = decode_latin9(&bytes);
        log::debug!("Response Status: {}", status);

        if text.contains(INVALID_CREDENTIALS) {
            return Err(DbError::Authentication);
        }
        if !status.is_success() {
            return Err(DbError::Remote {
                url,
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }

    pub async fn select_all(&self) -> Result<Vec<Record>> {
        let text = self.post(None, "select_all").await?;
        parse_rows(&text)
    }

    pub async fn select(&self, key: &RecordKey) -> Result<Vec<Record>> {
        let text = self.post(Some(key), "select_all").await?;
        parse_rows(&text)
    }

    pub async fn insert(&self, key: &RecordKey) -> Result<()> {
        self.post(Some(key), "insert").await.map(|_| ())
    }

    pub async fn delete(&self, key: &RecordKey) -> Result<()> {
        self.post(Some(key), "delete").await.map(|_| ())
    }
}

/// Parse a `select_all` response body.
pub fn parse_rows(text: &str) -> Result<Vec<Record>> {
    if text.contains(INVALID_CREDENTIALS) {
        return Err(DbError::Authentication);
    }
    serde_json::from_str(text).map_err(|source| DbError::Decode {
        source,
        body: text.to_string(),
    })
}

/// The endpoint answers in ISO-8859-15, which differs from Latin-1 on eight
/// code points.
pub fn decode_latin9(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| match b {
            0xA4 => '€',
            0xA6 => 'Š',
            0xA8 => 'š',
            0xB4 => 'Ž',
            0xB8 => 'ž',
            0xBC => 'Œ',
            0xBD => 'œ',
            0xBE => 'Ÿ',
            _ => b as char,
        })
        .collect()
}

/// Blocking facade over [`MosaClient`] so the reconciliation core stays
/// synchronous.
pub struct HttpRecordService {
    client: MosaClient,
    runtime: tokio::runtime::Runtime,
}

impl HttpRecordService {
    pub fn new(client: MosaClient) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(DbError::Runtime)?;
        Ok(Self { client, runtime })
    }

    pub fn client(&self) -> &MosaClient {
        &self.client
    }
}

impl RecordService for HttpRecordService {
    fn fetch_all(&self) -> Result<Vec<Record>> {
        self.runtime.block_on(self.client.select_all())
    }

    fn find(&self, key: &RecordKey) -> Result<Vec<Record>> {
        self.runtime.block_on(self.client.select(key))
    }

    fn insert_record(&self, key: &RecordKey) -> Result<()> {
        log::info!("Creating entry ({})", key);
        self.runtime.block_on(self.client.insert(key))
    }

    fn delete_record(&self, key: &RecordKey) -> Result<()> {
        log::info!("Deleting entry ({})", key);
        self.runtime.block_on(self.client.delete(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rows() {
        let text = r#"[{"ID":"42","Project":"FC_XX16E","Participant":"P01","Session":"SB01","Trial":"T1","File":"RawKinematics"}]"#;
        let rows = parse_rows(text).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 42);
        assert_eq!(rows[0].file_type, "RawKinematics");
    }

    #[test]
    fn test_parse_rows_detects_invalid_credentials() {
        let text = "<html># INVALID USER/PASSWORD COMBINATION</html>";
        assert!(matches!(parse_rows(text), Err(DbError::Authentication)));
    }

    #[test]
    fn test_parse_rows_reports_body_on_garbage() {
        match parse_rows("Warning: mysqli_connect()") {
            Err(DbError::Decode { body, .. }) => assert!(body.contains("mysqli")),
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_latin9() {
        assert_eq!(decode_latin9(b"Caf\xe9 \xa4"), "Café €");
        assert_eq!(decode_latin9(b"plain"), "plain");
    }

    #[test]
    fn test_form_skips_missing_key() {
        let form = Form {
            username: "u",
            password: "p",
            project: "FC",
            participant: None,
            session: None,
            trial: None,
            file: None,
            action: "select_all",
        };
        let json = serde_json::to_value(&form).unwrap();
        assert!(json.get("participant").is_none());
        assert_eq!(json["action"], "select_all");
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = MosaClient::new("https://example.org/db/", "FC", "u", "p").unwrap();
        assert_eq!(client.base_url(), "https://example.org/db");
    }
}
