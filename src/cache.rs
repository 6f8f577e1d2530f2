pub mod group;
pub mod policy;
pub mod remote;
pub mod store;

pub use group::CacheGroup;
pub use remote::RedisCache;
pub use store::RpcCache;
