use std::env;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use configparser::ini::Ini;
use log::{info, warn};

use crate::error::MastrError;

const SECTION_MASTR: &str = "MaStR";
const SECTION_OEP: &str = "OEP";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    /// MaStR number of the market actor presenting the token
    pub operator_id: String,
    pub api_token: String,
}

/// Sectioned key/value file holding the operator identity and the API token.
/// Only this struct touches the file.
pub struct CredentialStore {
    pub path: PathBuf,
}

impl CredentialStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// `$MASTR_CONFIG_DIR/credentials.cfg`, or `~/.open-MaStR/config/credentials.cfg`
    pub fn default_location() -> Self {
        let dir = match env::var("MASTR_CONFIG_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => {
                let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
                Path::new(&home).join(".open-MaStR").join("config")
            }
        };
        Self::new(dir.join("credentials.cfg"))
    }

    /// Load the MaStR credentials, prompting on the terminal if nothing is stored yet.
    pub fn load(&self) -> Result<Credentials, MastrError> {
        let stdin = io::stdin();
        let mut input = stdin.lock();
        let mut output = io::stderr();
        self.load_or_prompt(&mut input, &mut output)
    }

    /// Stored file first, then `MASTR_USER`/`MASTR_TOKEN` from the environment, then
    /// one prompt.  Whatever was not read from the file gets persisted.
    pub fn load_or_prompt<R: BufRead, W: Write>(
        &self,
        input: &mut R,
        output: &mut W,
    ) -> Result<Credentials, MastrError> {
        if self.path.exists() {
            return self
                .read_section(SECTION_MASTR)?
                .ok_or_else(|| self.config_error("section MaStR is missing user or token"));
        }

        let credentials = match (env::var("MASTR_USER"), env::var("MASTR_TOKEN")) {
            (Ok(user), Ok(token)) if !user.is_empty() && !token.is_empty() => Credentials {
                operator_id: user,
                api_token: token,
            },
            _ => {
                let user = prompt(input, output, "MaStR user (market actor number): ")?;
                let token = prompt(input, output, "MaStR API token: ")?;
                if user.is_empty() || token.is_empty() {
                    return Err(MastrError::MissingCredentials(
                        "empty user or token entered".to_string(),
                    ));
                }
                Credentials {
                    operator_id: user,
                    api_token: token,
                }
            }
        };
        self.save(&credentials)?;
        Ok(credentials)
    }

    /// Credentials for the open energy platform upload, if any were stored.
    pub fn load_oep(&self) -> Result<Option<Credentials>, MastrError> {
        if !self.path.exists() {
            return Ok(None);
        }
        self.read_section(SECTION_OEP)
    }

    pub fn save(&self, credentials: &Credentials) -> Result<(), MastrError> {
        self.write_section(SECTION_MASTR, credentials)
    }

    pub fn save_oep(&self, credentials: &Credentials) -> Result<(), MastrError> {
        self.write_section(SECTION_OEP, credentials)
    }

    fn read_section(&self, section: &str) -> Result<Option<Credentials>, MastrError> {
        let conf = self.read_file()?;
        match (conf.get(section, "user"), conf.get(section, "token")) {
            (Some(user), Some(token)) => Ok(Some(Credentials {
                operator_id: user,
                api_token: token,
            })),
            _ => Ok(None),
        }
    }

    fn write_section(&self, section: &str, credentials: &Credentials) -> Result<(), MastrError> {
        let mut conf = if self.path.exists() {
            self.read_file()?
        } else {
            Ini::new_cs()
        };
        conf.set(section, "user", Some(credentials.operator_id.clone()));
        conf.set(section, "token", Some(credentials.api_token.clone()));
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        conf.write(&self.path)?;
        info!("saved {} credentials to {}", section, self.path.display());
        Ok(())
    }

    // section names are case sensitive, `MaStR` is not `mastr`
    fn read_file(&self) -> Result<Ini, MastrError> {
        let mut conf = Ini::new_cs();
        conf.load(&self.path).map_err(|e| self.config_error(e))?;
        Ok(conf)
    }

    fn config_error<E: ToString>(&self, e: E) -> MastrError {
        MastrError::Config {
            path: self.path.clone(),
            message: e.to_string(),
        }
    }
}

fn prompt<R: BufRead, W: Write>(input: &mut R, output: &mut W, label: &str) -> io::Result<String> {
    write!(output, "{}", label)?;
    output.flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Non-secret settings of one run.  Defaults can be overridden with `MASTR_*`
/// environment variables, usually set from a `.env/<env>.env` file.
#[derive(Clone, Debug)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub duckdb_path: PathBuf,
    /// Label stamped on every record, see the `version` column
    pub data_version: String,
    pub liveness_timeout: Duration,
    pub threads: usize,
    /// Wall-clock windows like "08:00-18:00" during which fetching is not allowed
    pub blacklist: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let root = Path::new(&home).join(".open-MaStR");
        Settings {
            data_dir: root.join("data"),
            cache_dir: root.join("cache"),
            duckdb_path: root.join("data").join("mastr.duckdb"),
            data_version: "rust_v0.1.0".to_string(),
            liveness_timeout: Duration::from_secs(600),
            threads: 4,
            blacklist: vec!["08:00-18:00".to_string(), "23:30-01:00".to_string()],
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let mut settings = Settings::default();
        if let Ok(dir) = env::var("MASTR_DATA_DIR") {
            settings.duckdb_path = Path::new(&dir).join("mastr.duckdb");
            settings.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = env::var("MASTR_CACHE_DIR") {
            settings.cache_dir = PathBuf::from(dir);
        }
        if let Ok(path) = env::var("MASTR_DUCKDB_PATH") {
            settings.duckdb_path = PathBuf::from(path);
        }
        if let Ok(version) = env::var("MASTR_DATA_VERSION") {
            settings.data_version = version;
        }
        if let Ok(minutes) = env::var("MASTR_LIVENESS_MINUTES") {
            match minutes.parse::<u64>() {
                Ok(m) => settings.liveness_timeout = Duration::from_secs(60 * m),
                Err(_) => warn!("ignoring invalid MASTR_LIVENESS_MINUTES={}", minutes),
            }
        }
        if let Ok(threads) = env::var("MASTR_THREADS") {
            match threads.parse::<usize>() {
                Ok(n) if n > 0 => settings.threads = n,
                _ => warn!("ignoring invalid MASTR_THREADS={}", threads),
            }
        }
        if let Ok(windows) = env::var("MASTR_BLACKLIST") {
            settings.blacklist = windows
                .split(',')
                .map(|w| w.trim().to_string())
                .filter(|w| !w.is_empty())
                .collect();
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io::Cursor;

    #[test]
    fn prompt_once_then_read_back() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let store = CredentialStore::new(dir.path().join("config").join("credentials.cfg"));
        let mut input = Cursor::new("SOM123456789012\nsecret-token\n");
        let mut output = Vec::new();
        let credentials = store.load_or_prompt(&mut input, &mut output)?;
        assert_eq!(credentials.operator_id, "SOM123456789012");
        assert_eq!(credentials.api_token, "secret-token");
        assert!(String::from_utf8(output)?.contains("API token"));

        // second load must not prompt
        let mut empty = Cursor::new("");
        let again = store.load_or_prompt(&mut empty, &mut Vec::new())?;
        assert_eq!(again, credentials);

        let text = fs::read_to_string(&store.path)?;
        assert!(text.contains("[MaStR]"));
        assert!(text.contains("token=secret-token"));
        Ok(())
    }

    #[test]
    fn oep_section_is_kept_apart() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let store = CredentialStore::new(dir.path().join("credentials.cfg"));
        assert_eq!(store.load_oep()?, None);
        store.save(&Credentials {
            operator_id: "SOM1".to_string(),
            api_token: "t1".to_string(),
        })?;
        store.save_oep(&Credentials {
            operator_id: "oep_user".to_string(),
            api_token: "t2".to_string(),
        })?;
        let oep = store.load_oep()?.ok_or("missing OEP section")?;
        assert_eq!(oep.operator_id, "oep_user");
        let mut empty = Cursor::new("");
        let mastr = store.load_or_prompt(&mut empty, &mut Vec::new())?;
        assert_eq!(mastr.api_token, "t1");
        Ok(())
    }

    #[test]
    fn incomplete_file_is_an_error() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("credentials.cfg");
        fs::write(&path, "[MaStR]\nuser=SOM1\n")?;
        let store = CredentialStore::new(path);
        let res = store.load_or_prompt(&mut Cursor::new(""), &mut Vec::new());
        assert!(matches!(res, Err(MastrError::Config { .. })));
        Ok(())
    }
}
