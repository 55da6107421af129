//! ディスクキャッシュ
//!
//! ストレージキーごとに1ファイルのフラットなディスクキャッシュを提供します。
//! エントリの有効性はファイルのmtimeと固定TTLのみで判定します。

mod entry;
mod store;

pub use entry::CacheEntryInfo;
pub use store::CacheStore;
