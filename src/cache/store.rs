//! キャッシュストア
//!
//! ストレージキーをスラッシュ折り畳みでファイル名へ変換し、
//! フラットなディレクトリにオブジェクト本体を保存します。
//! エントリの有効性はmtimeと固定TTLのみで判定し、ミス・期限切れ・
//! 強制リフレッシュ時はオブジェクトストアから再取得して上書きします。
//!
//! 既知の制限: `a/b` と `a_b` は同一エントリへ折り畳まれます。
//! Content-Typeはサイドカーファイル（`<entry>.meta`）に保存され、
//! サイドカーが無い場合のみ拡張子からの推測にフォールバックします。

use super::entry::{clear_dir, entry_age, scan_entries, CacheEntryInfo, META_SUFFIX};
use crate::config::CacheSection;
use crate::store::{ObjectStore, StoreError, StoreObject};
use ftlog::warn;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// キャッシュストア
///
/// リクエスト間で共有されるのはディスク上のキャッシュディレクトリのみで、
/// 同一キーへの並行アクセスは二重取得と冪等な上書きとして許容されます。
pub struct CacheStore<S> {
    dir: PathBuf,
    ttl: Duration,
    store: S,
}

impl<S: ObjectStore> CacheStore<S> {
    /// 設定とオブジェクトストアからキャッシュストアを作成
    pub fn new(config: &CacheSection, store: S) -> Self {
        Self {
            dir: config.dir.clone(),
            ttl: Duration::from_secs(config.ttl_secs),
            store,
        }
    }

    /// キャッシュディレクトリ
    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// TTL（秒）
    #[inline]
    pub fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs()
    }

    /// キーに対応するエントリファイルのパス
    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(key.replace('/', "_"))
    }

    /// エントリに対応するサイドカーメタデータファイルのパス
    fn meta_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", key.replace('/', "_"), META_SUFFIX))
    }

    /// キャッシュディレクトリを作成（冪等・毎回呼び出し可）
    fn ensure_dir(&self) {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            warn!("cache dir create failed for {}: {}", self.dir.display(), e);
        }
    }

    /// エントリがTTL内かどうか
    fn is_valid(&self, path: &Path) -> bool {
        match entry_age(path) {
            Ok(age) => age < self.ttl,
            Err(_) => false,
        }
    }

    /// キャッシュヒット時のContent-Type
    ///
    /// 取得時に保存したサイドカーを優先し、無ければ拡張子から推測します。
    fn read_content_type(&self, key: &str) -> String {
        match std::fs::read_to_string(self.meta_path(key)) {
            Ok(content_type) if !content_type.trim().is_empty() => {
                content_type.trim().to_string()
            }
            _ => guess_content_type(key),
        }
    }

    /// 取得したオブジェクトをディスクへ保存（ベストエフォート）
    ///
    /// 書き込み失敗はログに残して握りつぶします。呼び出し元は
    /// 取得済みのバイト列をそのまま返せます。
    fn persist(&self, key: &str, object: &StoreObject) {
        let entry = self.entry_path(key);
        if let Err(e) = std::fs::write(&entry, &object.body) {
            warn!("cache write failed for {}: {}", entry.display(), e);
            return;
        }
        if let Err(e) = std::fs::write(self.meta_path(key), &object.content_type) {
            warn!("cache metadata write failed for key {}: {}", key, e);
        }
    }

    /// キャッシュまたはオブジェクトストアからキーを取得
    ///
    /// - TTL内のエントリがあり `force_refresh` でなければキャッシュから返す
    /// - それ以外はストアから取得して上書き保存
    /// - ストアにキーが存在しない場合は `Ok(None)`（ネガティブキャッシュなし）
    /// - NotFound以外のストアエラーはそのまま伝播
    pub async fn get(
        &self,
        key: &str,
        force_refresh: bool,
    ) -> Result<Option<(Vec<u8>, String)>, StoreError> {
        self.ensure_dir();

        let entry = self.entry_path(key);
        if !force_refresh && self.is_valid(&entry) {
            // 有効なエントリでも読めない場合（並行clear等）は取得へフォールスルー
            if let Ok(body) = std::fs::read(&entry) {
                return Ok(Some((body, self.read_content_type(key))));
            }
        }

        match self.store.get_object(key).await {
            Ok(object) => {
                self.persist(key, &object);
                Ok(Some((object.body, object.content_type)))
            }
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// キャッシュエントリの一覧（管理エンドポイント用）
    pub fn entries(&self) -> io::Result<Vec<CacheEntryInfo>> {
        scan_entries(&self.dir, self.ttl)
    }

    /// 全キャッシュエントリを削除し、削除ファイル数を返す
    pub fn clear(&self) -> io::Result<usize> {
        clear_dir(&self.dir)
    }
}

/// 拡張子からContent-Typeを推測（不明な場合はapplication/octet-stream）
pub fn guess_content_type(key: &str) -> String {
    mime_guess::from_path(key)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
