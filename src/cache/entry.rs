//! キャッシュエントリ列挙
//!
//! 管理エンドポイント（キャッシュ状態表示・全消去）が利用する
//! フラットディレクトリの走査プリミティブを提供します。

use serde::Serialize;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// サイドカーメタデータファイルの拡張子
pub(crate) const META_SUFFIX: &str = ".meta";

/// キャッシュエントリ情報
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryInfo {
    /// エントリのファイル名（スラッシュ折り畳み済みキー）
    pub file: String,
    /// サイズ（バイト）
    pub size: u64,
    /// 経過秒数（現在時刻 - mtime）
    pub age_seconds: u64,
    /// TTL内かどうか
    pub valid: bool,
}

/// エントリの経過時間を取得
pub(crate) fn entry_age(path: &Path) -> io::Result<Duration> {
    let mtime = std::fs::metadata(path)?.modified()?;
    Ok(SystemTime::now()
        .duration_since(mtime)
        .unwrap_or(Duration::ZERO))
}

/// キャッシュディレクトリを走査してエントリ一覧を返す
///
/// サイドカーメタデータファイルはエントリとして列挙しません。
pub(crate) fn scan_entries(dir: &Path, ttl: Duration) -> io::Result<Vec<CacheEntryInfo>> {
    let mut entries = Vec::new();

    if !dir.exists() {
        return Ok(entries);
    }

    for dir_entry in std::fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        let path = dir_entry.path();
        if !path.is_file() {
            continue;
        }

        let file = dir_entry.file_name().to_string_lossy().into_owned();
        if file.ends_with(META_SUFFIX) {
            continue;
        }

        let metadata = dir_entry.metadata()?;
        let age = entry_age(&path)?;

        entries.push(CacheEntryInfo {
            file,
            size: metadata.len(),
            age_seconds: age.as_secs(),
            valid: age < ttl,
        });
    }

    Ok(entries)
}

/// キャッシュディレクトリ内の全ファイルを削除
///
/// 削除したファイル数（メタデータファイル込み）を返します。
pub(crate) fn clear_dir(dir: &Path) -> io::Result<usize> {
    let mut cleared = 0;

    if !dir.exists() {
        return Ok(cleared);
    }

    for dir_entry in std::fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        let path = dir_entry.path();
        if path.is_file() {
            std::fs::remove_file(&path)?;
            cleared += 1;
        }
    }

    Ok(cleared)
}
