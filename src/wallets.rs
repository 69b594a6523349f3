use crate::{
    config::{
        WALLET_PASSWORD_ENV,
        home_dir,
        resolve_dir,
        visible_files,
    },
    gateway::ChainError,
    types::Account,
    wallet_session::{
        WalletNotification,
        WalletProvider,
    },
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use eth_keystore::decrypt_key;
use ethers::signers::{
    LocalWallet,
    MnemonicBuilder,
    Signer,
    coins_bip39::English,
};
use rpassword::prompt_password;
use std::path::{
    Path,
    PathBuf,
};
use tokio::sync::broadcast;

/// A keystore file, named after the file with any `.json` dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalletDescriptor {
    pub name: String,
    pub path: PathBuf,
}

impl WalletDescriptor {
    fn from_path(path: PathBuf) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?;
        let name = file_name.strip_suffix(".json").unwrap_or(file_name).to_owned();
        Some(Self { name, path })
    }
}

pub fn default_wallet_dir() -> Result<PathBuf> {
    Ok(home_dir()?.join(".foundry").join("keystores"))
}

pub fn resolve_wallet_dir(dir: Option<&str>) -> Result<PathBuf> {
    resolve_dir(dir, default_wallet_dir)
}

pub fn list_wallets(dir: &Path) -> Result<Vec<WalletDescriptor>> {
    let mut wallets: Vec<_> = visible_files(dir)?
        .into_iter()
        .filter_map(WalletDescriptor::from_path)
        .collect();
    wallets.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(wallets)
}

pub fn find_wallet(dir: &Path, name: &str) -> Result<WalletDescriptor> {
    list_wallets(dir)?
        .into_iter()
        .find(|wallet| wallet.name == name)
        .ok_or_else(|| eyre!("No keystore named '{name}' in {}", dir.display()))
}

fn wallet_password(descriptor: &WalletDescriptor) -> Result<String> {
    if let Ok(password) = std::env::var(WALLET_PASSWORD_ENV) {
        return Ok(password);
    }
    let prompt = format!("Enter password for wallet '{}': ", descriptor.name);
    prompt_password(prompt).wrap_err("Failed to read wallet password")
}

pub fn unlock_wallet(descriptor: &WalletDescriptor) -> Result<LocalWallet> {
    let password = wallet_password(descriptor)?;
    let secret = decrypt_key(&descriptor.path, password.as_bytes())
        .map_err(|_| eyre!("Invalid password for wallet '{}'", descriptor.name))?;
    wallet_from_secret(&descriptor.name, &secret)
}

/// Accepts a raw 32-byte private key or a BIP-39 phrase (first account).
fn wallet_from_secret(name: &str, secret: &[u8]) -> Result<LocalWallet> {
    if secret.len() == 32
        && let Ok(wallet) = LocalWallet::from_bytes(secret)
    {
        return Ok(wallet);
    }

    if let Ok(mnemonic) = std::str::from_utf8(secret) {
        let word_count = mnemonic.split_whitespace().count();
        if word_count >= 12 {
            return MnemonicBuilder::<English>::default()
                .phrase(mnemonic.trim())
                .build()
                .wrap_err_with(|| format!("Failed to derive key for wallet '{name}'"));
        }
    }

    Err(eyre!("Wallet '{name}' contained unsupported key material"))
}

/// A single unlocked keystore account. The account never changes for the
/// life of the process, so no notifications are ever sent.
pub struct KeystoreWallet {
    wallet: LocalWallet,
    account: Account,
    notifications: broadcast::Sender<WalletNotification>,
}

impl KeystoreWallet {
    pub fn new(wallet: LocalWallet) -> Self {
        let (notifications, _) = broadcast::channel(4);
        Self {
            account: Account::from(wallet.address()),
            wallet,
            notifications,
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }
}

impl WalletProvider for KeystoreWallet {
    type Signer = LocalWallet;

    fn is_available(&self) -> bool {
        true
    }

    async fn request_accounts(&self) -> Result<Vec<Account>, ChainError> {
        Ok(vec![self.account.clone()])
    }

    async fn accounts(&self) -> Result<Vec<Account>, ChainError> {
        Ok(vec![self.account.clone()])
    }

    async fn signer(&self, account: &Account) -> Result<LocalWallet, ChainError> {
        if account != &self.account {
            return Err(ChainError::message(format!(
                "keystore holds {}, not {account}",
                self.account
            )));
        }
        Ok(self.wallet.clone())
    }

    fn notifications(&self) -> broadcast::Receiver<WalletNotification> {
        self.notifications.subscribe()
    }
}
