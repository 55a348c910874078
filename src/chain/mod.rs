// On-chain plumbing: the opaque pool SDK boundary, the serialized RPC
// executor, the pool adapter and the wallet service
pub mod pool;
pub mod rpc;
pub mod sdk;
pub mod wallet;

pub use pool::PoolClient;
pub use rpc::{ChainExecutor, RpcExecutor};
pub use sdk::{ActiveBin, CreatePositionRequest, CreatedPosition, DlmmSdk, OnchainPosition};
pub use wallet::{BalanceProvider, BalanceReader, WalletService};
