//! Ledger entities: markets, assets, users, positions, GHO discount state.

use super::primitives::{Address, MarketId, U256};
use crate::engine::math::RAY;
use serde::{Deserialize, Serialize};

/// Role of a scaled-balance token contract within a market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TokenRole {
    /// Interest-bearing collateral token (aToken).
    Collateral,
    /// Variable debt token.
    Debt,
    /// Discount-eligible variable debt token (GHO).
    GhoDebt,
}

impl TokenRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenRole::Collateral => "collateral",
            TokenRole::Debt => "debt",
            TokenRole::GhoDebt => "gho_debt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "collateral" => Some(TokenRole::Collateral),
            "debt" => Some(TokenRole::Debt),
            "gho_debt" => Some(TokenRole::GhoDebt),
            _ => None,
        }
    }

    pub fn position_kind(&self) -> PositionKind {
        match self {
            TokenRole::Collateral => PositionKind::Collateral,
            TokenRole::Debt | TokenRole::GhoDebt => PositionKind::Debt,
        }
    }
}

impl std::fmt::Display for TokenRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discount configuration set by the GHO debt token's admin events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GhoConfig {
    pub discount_token: Option<Address>,
    pub discount_rate_strategy: Option<Address>,
}

/// One lending-protocol deployment on one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub id: MarketId,
    pub chain_id: u64,
    pub pool: Address,
    pub active: bool,
    /// First block synced when no checkpoint exists yet.
    pub start_block: u64,
    /// Advances only after a chunk commits and verifies.
    pub last_processed_block: Option<u64>,
    pub gho: GhoConfig,
    /// Set when verification failed; sync refuses to run until cleared.
    pub paused_reason: Option<String>,
}

impl Market {
    /// First block of the next chunk.
    pub fn next_block(&self) -> u64 {
        match self.last_processed_block {
            Some(block) => block + 1,
            None => self.start_block,
        }
    }
}

/// A reserve listed in a market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub underlying: Address,
    pub collateral_token: Address,
    pub debt_token: Address,
    pub collateral_revision: u32,
    pub debt_revision: u32,
    /// The one debt asset whose interest is subject to the discount mechanism.
    pub discount_eligible: bool,
    pub liquidity_index: U256,
    pub variable_borrow_index: U256,
    pub liquidity_rate: U256,
    pub variable_borrow_rate: U256,
    pub last_update_block: Option<u64>,
}

impl Asset {
    /// New reserve with both indices at 1.0 ray.
    pub fn new(
        underlying: Address,
        collateral_token: Address,
        debt_token: Address,
        collateral_revision: u32,
        debt_revision: u32,
        discount_eligible: bool,
    ) -> Self {
        Asset {
            underlying,
            collateral_token,
            debt_token,
            collateral_revision,
            debt_revision,
            discount_eligible,
            liquidity_index: RAY,
            variable_borrow_index: RAY,
            liquidity_rate: U256::ZERO,
            variable_borrow_rate: U256::ZERO,
            last_update_block: None,
        }
    }

    pub fn debt_role(&self) -> TokenRole {
        if self.discount_eligible {
            TokenRole::GhoDebt
        } else {
            TokenRole::Debt
        }
    }

    pub fn token(&self, kind: PositionKind) -> Address {
        match kind {
            PositionKind::Collateral => self.collateral_token,
            PositionKind::Debt => self.debt_token,
        }
    }

    pub fn revision(&self, kind: PositionKind) -> u32 {
        match kind {
            PositionKind::Collateral => self.collateral_revision,
            PositionKind::Debt => self.debt_revision,
        }
    }

    pub fn index(&self, kind: PositionKind) -> U256 {
        match kind {
            PositionKind::Collateral => self.liquidity_index,
            PositionKind::Debt => self.variable_borrow_index,
        }
    }
}

/// An address observed interacting with a market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub address: Address,
    pub e_mode: u8,
    /// Snapshot of the user's discount-token balance.
    pub discount_token_balance: U256,
    /// Token `discount_token_balance` was seeded from; `None` until first seeded.
    pub discount_balance_token: Option<Address>,
}

impl User {
    pub fn new(address: Address) -> Self {
        User {
            address,
            e_mode: 0,
            discount_token_balance: U256::ZERO,
            discount_balance_token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PositionKind {
    Collateral,
    Debt,
}

impl PositionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionKind::Collateral => "collateral",
            PositionKind::Debt => "debt",
        }
    }
}

/// Identity of a collateral or debt position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub kind: PositionKind,
    pub user: Address,
    /// Underlying asset address.
    pub asset: Address,
}

impl PositionKey {
    pub fn collateral(user: Address, asset: Address) -> Self {
        PositionKey {
            kind: PositionKind::Collateral,
            user,
            asset,
        }
    }

    pub fn debt(user: Address, asset: Address) -> Self {
        PositionKey {
            kind: PositionKind::Debt,
            user,
            asset,
        }
    }
}

impl std::fmt::Display for PositionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({}, {})", self.kind.as_str(), self.user, self.asset)
    }
}

/// Scaled balance of one user in one reserve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub key: PositionKey,
    pub scaled_balance: U256,
    /// Index at the last balance-changing event; zero before the first one.
    pub last_index: U256,
    /// Interest credited across all accruals.
    pub accumulated_interest: U256,
}

impl Position {
    pub fn new(key: PositionKey) -> Self {
        Position {
            key,
            scaled_balance: U256::ZERO,
            last_index: U256::ZERO,
            accumulated_interest: U256::ZERO,
        }
    }
}

/// Signed change to a scaled balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaledDelta {
    Increase(U256),
    Decrease(U256),
}

impl ScaledDelta {
    pub const ZERO: ScaledDelta = ScaledDelta::Increase(U256::ZERO);

    /// `added - removed` as a signed delta.
    pub fn net(added: U256, removed: U256) -> Self {
        if added >= removed {
            ScaledDelta::Increase(added - removed)
        } else {
            ScaledDelta::Decrease(removed - added)
        }
    }

    /// New balance, `None` if it would go negative or overflow.
    pub fn apply_to(&self, balance: U256) -> Option<U256> {
        match self {
            ScaledDelta::Increase(amount) => balance.checked_add(*amount),
            ScaledDelta::Decrease(amount) => balance.checked_sub(*amount),
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            ScaledDelta::Increase(amount) | ScaledDelta::Decrease(amount) => amount.is_zero(),
        }
    }
}

impl std::fmt::Display for ScaledDelta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScaledDelta::Increase(amount) => write!(f, "+{}", amount),
            ScaledDelta::Decrease(amount) => write!(f, "-{}", amount),
        }
    }
}

/// Discount in basis points, always within [0, 10000].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DiscountPercent(u16);

impl DiscountPercent {
    pub const MAX_BPS: u16 = 10_000;

    pub(crate) fn from_bps(bps: u16) -> Option<Self> {
        (bps <= Self::MAX_BPS).then_some(DiscountPercent(bps))
    }

    pub fn bps(&self) -> u16 {
        self.0
    }

    pub fn as_u256(&self) -> U256 {
        U256::from(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for DiscountPercent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}bps", self.0)
    }
}

/// Discount state of one user on the discount-eligible debt asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GhoUserState {
    pub user: Address,
    /// Interest accrued net of discounts.
    pub accumulated_debt_interest: U256,
    pub discount_percent: DiscountPercent,
}

impl GhoUserState {
    pub fn new(user: Address) -> Self {
        GhoUserState {
            user,
            accumulated_debt_interest: U256::ZERO,
            discount_percent: DiscountPercent::default(),
        }
    }
}

/// Which math revision governs a token contract from a given block on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRevision {
    pub token: Address,
    pub role: TokenRole,
    pub revision: u32,
    pub since_block: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_role_round_trip() {
        for role in [TokenRole::Collateral, TokenRole::Debt, TokenRole::GhoDebt] {
            assert_eq!(TokenRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(TokenRole::parse("stable_debt"), None);
    }

    #[test]
    fn test_scaled_delta_net_and_apply() {
        let u = |v: u64| U256::from(v);
        assert_eq!(ScaledDelta::net(u(10), u(3)), ScaledDelta::Increase(u(7)));
        assert_eq!(ScaledDelta::net(u(3), u(10)), ScaledDelta::Decrease(u(7)));
        assert_eq!(ScaledDelta::Decrease(u(7)).apply_to(u(10)), Some(u(3)));
        assert_eq!(ScaledDelta::Decrease(u(11)).apply_to(u(10)), None);
        assert!(ScaledDelta::net(u(4), u(4)).is_zero());
    }

    #[test]
    fn test_discount_percent_bounds() {
        assert_eq!(DiscountPercent::from_bps(10_000).map(|d| d.bps()), Some(10_000));
        assert!(DiscountPercent::from_bps(10_001).is_none());
    }

    #[test]
    fn test_market_next_block() {
        let mut market = Market {
            id: MarketId::new(1),
            chain_id: 1,
            pool: Address::ZERO,
            active: true,
            start_block: 100,
            last_processed_block: None,
            gho: GhoConfig::default(),
            paused_reason: None,
        };
        assert_eq!(market.next_block(), 100);
        market.last_processed_block = Some(150);
        assert_eq!(market.next_block(), 151);
    }

    #[test]
    fn test_asset_debt_role() {
        let mut asset = Asset::new(
            Address::repeat_byte(1),
            Address::repeat_byte(2),
            Address::repeat_byte(3),
            1,
            1,
            false,
        );
        assert_eq!(asset.debt_role(), TokenRole::Debt);
        asset.discount_eligible = true;
        assert_eq!(asset.debt_role(), TokenRole::GhoDebt);
        assert_eq!(asset.index(PositionKind::Debt), RAY);
    }
}
