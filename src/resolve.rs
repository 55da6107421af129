//! コンテンツリゾルバ
//!
//! リクエストパスに対して順序付きのフォールバック戦略チェーンを適用し、
//! 最初に成功した戦略でストレージキーを解決します。各戦略は候補キーを
//! 導出するだけで、取得とキャッシュ有効性の判定はキャッシュストアが
//! 担当します。
//!
//! 解決順序:
//! 1. 直接ヒット
//! 2. ディレクトリインデックス（`key/index.html` または `key` + `index.html`）
//! 3. サブディレクトリリダイレクト（先頭セグメントの `index.html`）
//! 4. ルートフォールバック（`index.html`）
//!
//! `force_refresh` は全戦略へそのまま伝播します。NotFound以外の
//! ストアエラーは即座に解決を中断して伝播します。

use crate::cache::CacheStore;
use crate::store::{ObjectStore, StoreError};

/// ルートおよびディレクトリアクセス時に補われるインデックスファイル名
const INDEX_FILE: &str = "index.html";

// ====================
// リクエストパス
// ====================

/// 正規化済みのリクエストパス
///
/// `original` はヘッダー出力用の元パス（先頭スラッシュ付き）、
/// `key` は正規化済みストレージキー（先頭スラッシュなし、
/// 空パスは `index.html`）です。
#[derive(Debug, Clone)]
pub struct RequestPath {
    original: String,
    key: String,
}

impl RequestPath {
    /// 生のリクエストパスから作成
    pub fn new(raw: &str) -> Self {
        let original = if raw.starts_with('/') {
            raw.to_string()
        } else {
            format!("/{}", raw)
        };

        let stripped = raw.trim_start_matches('/');
        let key = if stripped.is_empty() {
            INDEX_FILE.to_string()
        } else {
            stripped.to_string()
        };

        Self { original, key }
    }

    /// 元のリクエストパス
    #[inline]
    pub fn original(&self) -> &str {
        &self.original
    }

    /// 正規化済みストレージキー
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// 元パスの先頭セグメント（前後のスラッシュを除去して分割）
    fn first_segment(&self) -> Option<&str> {
        self.original
            .trim_matches('/')
            .split('/')
            .next()
            .filter(|s| !s.is_empty())
    }
}

// ====================
// 解決戦略
// ====================

/// 解決戦略（評価順に並んだタグ付きバリアント）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// 正規化済みキーをそのまま取得
    DirectHit,
    /// パスをディレクトリとみなし `index.html` を補って取得
    DirectoryIndex,
    /// 先頭セグメントの `index.html` で未解決パスを受ける
    SubdirectoryRedirect,
    /// ルートの `index.html` へフォールバック
    RootFallback,
}

/// 戦略チェーン（この順で評価し、最初の成功で打ち切り）
pub const STRATEGY_CHAIN: [Strategy; 4] = [
    Strategy::DirectHit,
    Strategy::DirectoryIndex,
    Strategy::SubdirectoryRedirect,
    Strategy::RootFallback,
];

impl Strategy {
    /// この戦略が試行する候補キーを導出（対象外の場合はNone）
    fn candidate(self, path: &RequestPath) -> Option<String> {
        match self {
            Strategy::DirectHit => Some(path.key().to_string()),
            Strategy::DirectoryIndex => {
                let key = path.key();
                if key.ends_with('/') {
                    // 末尾スラッシュ付きリクエスト
                    Some(format!("{}{}", key, INDEX_FILE))
                } else if !key.ends_with(".html") {
                    Some(format!("{}/{}", key, INDEX_FILE))
                } else {
                    None
                }
            }
            Strategy::SubdirectoryRedirect => path
                .first_segment()
                .map(|segment| format!("{}/{}", segment, INDEX_FILE)),
            Strategy::RootFallback => Some(INDEX_FILE.to_string()),
        }
    }
}

// ====================
// 解決結果
// ====================

/// 解決結果
#[derive(Debug)]
pub enum Resolution {
    /// いずれかの戦略で解決された
    Found {
        strategy: Strategy,
        /// 実際に配信されるストレージキー
        key: String,
        body: Vec<u8>,
        content_type: String,
    },
    /// 全戦略が失敗（404として扱う。エラーではない）
    NotFound,
}

// ====================
// リゾルバ
// ====================

/// コンテンツリゾルバ
pub struct Resolver<S> {
    cache: CacheStore<S>,
}

impl<S: ObjectStore> Resolver<S> {
    /// キャッシュストアからリゾルバを作成
    pub fn new(cache: CacheStore<S>) -> Self {
        Self { cache }
    }

    /// キャッシュストアへの参照（管理エンドポイント用）
    #[inline]
    pub fn cache(&self) -> &CacheStore<S> {
        &self.cache
    }

    /// リクエストパスを解決
    pub async fn resolve(
        &self,
        raw_path: &str,
        force_refresh: bool,
    ) -> Result<Resolution, StoreError> {
        let path = RequestPath::new(raw_path);

        for strategy in STRATEGY_CHAIN {
            let Some(key) = strategy.candidate(&path) else {
                continue;
            };

            if let Some((body, content_type)) = self.cache.get(&key, force_refresh).await? {
                return Ok(Resolution::Found {
                    strategy,
                    key,
                    body,
                    content_type,
                });
            }
        }

        Ok(Resolution::NotFound)
    }
}
