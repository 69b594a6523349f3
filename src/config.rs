use crate::{
    context::ContextOptions,
    gateway::CallOptions,
    types::Account,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
};
use std::{
    fmt,
    fs,
    path::{
        Path,
        PathBuf,
    },
    time::Duration,
};

pub const DEFAULT_LOCAL_RPC_URL: &str = "http://127.0.0.1:8545";
pub const DEFAULT_TESTNET_RPC_URL: &str = "https://api.avax-test.network/ext/bc/C/rpc";
/// First contract deployed by the default account of a fresh local node.
pub const DEFAULT_CONTRACT_ADDRESS: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2_000);
pub const WALLET_PASSWORD_ENV: &str = "BATTLE_ROYALE_WALLET_PASSWORD";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkTarget {
    Local { url: String },
    Testnet { url: String },
}

impl NetworkTarget {
    pub fn local(url: Option<String>) -> Self {
        NetworkTarget::Local {
            url: url.unwrap_or_else(|| DEFAULT_LOCAL_RPC_URL.to_owned()),
        }
    }

    pub fn testnet(url: Option<String>) -> Self {
        NetworkTarget::Testnet {
            url: url.unwrap_or_else(|| DEFAULT_TESTNET_RPC_URL.to_owned()),
        }
    }

    pub fn url(&self) -> &str {
        match self {
            NetworkTarget::Local { url } | NetworkTarget::Testnet { url } => url,
        }
    }
}

impl fmt::Display for NetworkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkTarget::Local { url } => write!(f, "Local ({url})"),
            NetworkTarget::Testnet { url } => write!(f, "Testnet ({url})"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalletConfig {
    Keystore { name: String, dir: PathBuf },
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub network: NetworkTarget,
    pub contract: Account,
    pub wallet: WalletConfig,
    pub call_options: CallOptions,
    pub poll_interval: Duration,
    pub data_dir: PathBuf,
}

impl AppConfig {
    pub fn context_options(&self) -> ContextOptions {
        ContextOptions {
            call_options: self.call_options,
            ..ContextOptions::default()
        }
    }
}

pub fn home_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").wrap_err("HOME environment variable not set")?;
    Ok(PathBuf::from(home))
}

pub fn default_data_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join(".battle-royale"))
}

/// Expands `~` in a user-supplied directory, or falls back to `default`.
pub fn resolve_dir(
    dir: Option<&str>,
    default: impl FnOnce() -> Result<PathBuf>,
) -> Result<PathBuf> {
    match dir {
        Some(raw) => Ok(PathBuf::from(shellexpand::tilde(raw).into_owned())),
        None => default(),
    }
}

/// Regular, non-hidden files directly inside `dir`, sorted by path. A
/// missing directory has no files.
pub fn visible_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir)
        .wrap_err_with(|| format!("Failed to read {}", dir.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.wrap_err("Failed to read directory entry")?.path();
        let hidden = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_none_or(|name| name.starts_with('.'));
        if path.is_file() && !hidden {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn network_target__falls_back_to_default_urls() {
        assert_eq!(NetworkTarget::local(None).url(), DEFAULT_LOCAL_RPC_URL);
        assert_eq!(
            NetworkTarget::testnet(Some("http://node:9650".into())).url(),
            "http://node:9650"
        );
    }

    #[test]
    fn resolve_dir__uses_default_when_unset() {
        // given
        let fallback = PathBuf::from("/var/lib/battle-royale");

        // when
        let resolved = resolve_dir(None, || Ok(fallback.clone())).unwrap();

        // then
        assert_eq!(resolved, fallback);
    }

    #[test]
    fn visible_files__skips_hidden_files_and_directories() {
        // given
        let dir = tempdir::TempDir::new("data").unwrap();
        fs::write(dir.path().join("b.json"), b"{}").unwrap();
        fs::write(dir.path().join("a"), b"{}").unwrap();
        fs::write(dir.path().join(".lock"), b"").unwrap();
        fs::create_dir(dir.path().join("logs")).unwrap();

        // when
        let files = visible_files(dir.path()).unwrap();

        // then
        assert_eq!(
            files,
            vec![dir.path().join("a"), dir.path().join("b.json")]
        );
    }

    #[test]
    fn visible_files__missing_dir_is_empty() {
        let files = visible_files(Path::new("/definitely/not/a/real/dir")).unwrap();

        assert!(files.is_empty());
    }

    #[test]
    fn resolve_dir__keeps_absolute_paths() {
        let resolved = resolve_dir(Some("/tmp/keys"), || unreachable!()).unwrap();

        assert_eq!(resolved, PathBuf::from("/tmp/keys"));
    }
}
