use crate::error::SessionError;
use ethers::types::Address;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt,
    hash::{
        Hash,
        Hasher,
    },
    str::FromStr,
};

pub const NULL_ACCOUNT: &str = "0x0000000000000000000000000000000000000000";

/// A chain address. Comparison and hashing ignore ASCII case because
/// nodes and wallets hand back checksummed and lowercase forms of the
/// same address interchangeably.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Account(String);

impl Account {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn null() -> Self {
        Self(NULL_ACCOUNT.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the all-zero address, which the contract uses for "unset".
    pub fn is_null(&self) -> bool {
        let digits = strip_hex_prefix(&self.0);
        !digits.is_empty() && digits.bytes().all(|b| b == b'0')
    }

    pub fn to_address(&self) -> Result<Address, SessionError> {
        Address::from_str(&self.0).map_err(|err| {
            SessionError::InvalidInput(format!("'{}' is not an address: {err}", self.0))
        })
    }
}

fn strip_hex_prefix(raw: &str) -> &str {
    raw.strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw)
}

impl PartialEq for Account {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for Account {}

impl Hash for Account {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for byte in self.0.bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Account {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = strip_hex_prefix(trimmed);
        let bytes = hex::decode(digits).map_err(|err| {
            SessionError::InvalidInput(format!("'{trimmed}' is not hex encoded: {err}"))
        })?;
        if bytes.len() != 20 {
            return Err(SessionError::InvalidInput(format!(
                "'{trimmed}' is {} bytes long, expected 20",
                bytes.len()
            )));
        }
        Ok(Self(format!("0x{digits}")))
    }
}

impl From<Address> for Account {
    fn from(address: Address) -> Self {
        Self(ethers::utils::to_checksum(&address, None))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BattleStatus {
    Pending,
    Active,
    Resolved,
}

impl BattleStatus {
    /// Maps the contract's `uint8` status code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(BattleStatus::Pending),
            1 => Some(BattleStatus::Active),
            2 => Some(BattleStatus::Resolved),
            _ => None,
        }
    }
}

/// Read-only snapshot of one battle. `id` is the battle's position in the
/// contract's battle array.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Battle {
    pub id: u64,
    pub name: String,
    pub players: Vec<Account>,
    pub status: BattleStatus,
    pub winner: Account,
}

impl Battle {
    pub fn has_player(&self, account: &Account) -> bool {
        !account.is_null() && self.players.iter().any(|player| player == account)
    }

    /// Still waiting for a second player.
    pub fn awaits_opponent(&self) -> bool {
        self.players.len() < 2 && self.status != BattleStatus::Resolved
    }

    /// The account is fighting in this battle and nobody has won yet.
    pub fn is_active_for(&self, account: &Account) -> bool {
        self.status == BattleStatus::Active
            && self.winner.is_null()
            && self.has_player(account)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum Registration {
    #[default]
    Unknown,
    Registered,
    Unregistered,
}

/// Derived view of the chain for the connected account. Always replaced as
/// a whole.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GameView {
    pub pending_battles: Vec<Battle>,
    pub active_battle: Option<Battle>,
    pub registration: Registration,
}

impl GameView {
    /// The pending battle this account opened and is waiting in, if any.
    pub fn waiting_battle(&self, account: &Account) -> Option<&Battle> {
        self.pending_battles
            .iter()
            .find(|battle| battle.has_player(account))
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn account_eq__ignores_case() {
        // given
        let checksummed = Account::new("0x5FbDB2315678afecb367f032d93F642f64180aa3");
        let lower = Account::new("0x5fbdb2315678afecb367f032d93f642f64180aa3");

        // when
        let mut set = HashSet::new();
        set.insert(checksummed.clone());

        // then
        assert_eq!(checksummed, lower);
        assert!(set.contains(&lower));
    }

    #[test]
    fn is_null__recognises_zero_address_in_any_form() {
        assert!(Account::null().is_null());
        assert!(Account::new("0X0000000000000000000000000000000000000000").is_null());
        assert!(!Account::new("0x0000000000000000000000000000000000000001").is_null());
        assert!(!Account::new("").is_null());
    }

    #[test]
    fn from_str__rejects_short_addresses() {
        let result = "0x1234".parse::<Account>();

        assert!(matches!(result, Err(SessionError::InvalidInput(_))));
    }

    #[test]
    fn from_address__round_trips_through_to_address() {
        // given
        let address = Address::from([0xabu8; 20]);

        // when
        let account = Account::from(address);

        // then
        assert_eq!(account.to_address().unwrap(), address);
        assert_eq!(account, Account::new(format!("{address:#x}")));
    }

    #[test]
    fn has_player__never_matches_null_account() {
        // given
        let battle = Battle {
            id: 3,
            name: "arena".into(),
            players: vec![Account::null()],
            status: BattleStatus::Pending,
            winner: Account::null(),
        };

        // then
        assert!(!battle.has_player(&Account::null()));
    }
}
