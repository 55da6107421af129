//! 解決パイプライン統合テスト
//!
//! モックS3サーバーに対して S3クライアント → ディスクキャッシュ →
//! リゾルバの実パイプラインを通し、フォールバックチェーンと
//! キャッシュ動作を検証します。

mod common;

use common::MockS3Server;
use kagami::cache::CacheStore;
use kagami::config::CacheSection;
use kagami::resolve::{Resolution, Resolver, Strategy};
use kagami::store::{S3Client, StoreError};
use std::future::Future;
use std::path::Path;
use tempfile::tempdir;

fn block_on<F: Future>(fut: F) -> F::Output {
    monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
        .enable_timer()
        .build()
        .unwrap()
        .block_on(fut)
}

fn make_resolver(server: &MockS3Server, cache_dir: &Path, ttl_secs: u64) -> Resolver<S3Client> {
    let client = S3Client::new(&server.endpoint_url()).unwrap();
    let config = CacheSection {
        dir: cache_dir.to_path_buf(),
        ttl_secs,
    };
    Resolver::new(CacheStore::new(&config, client))
}

fn expect_found(resolution: Resolution) -> (Strategy, String, Vec<u8>, String) {
    match resolution {
        Resolution::Found {
            strategy,
            key,
            body,
            content_type,
        } => (strategy, key, body, content_type),
        Resolution::NotFound => panic!("expected Found, got NotFound"),
    }
}

#[test]
fn test_direct_hit_end_to_end() {
    let server = MockS3Server::start(&[("page.html", "<html>page</html>", "text/html")]);
    let dir = tempdir().unwrap();
    let resolver = make_resolver(&server, dir.path(), 60);

    let (strategy, key, body, content_type) =
        expect_found(block_on(resolver.resolve("/page.html", false)).unwrap());

    assert_eq!(strategy, Strategy::DirectHit);
    assert_eq!(key, "page.html");
    assert_eq!(body, b"<html>page</html>");
    assert_eq!(content_type, "text/html");
    assert_eq!(server.hits_for("page.html"), 1);
}

#[test]
fn test_cache_hit_skips_upstream() {
    let server = MockS3Server::start(&[("index.html", "<html>top</html>", "text/html")]);
    let dir = tempdir().unwrap();
    let resolver = make_resolver(&server, dir.path(), 3600);

    block_on(resolver.resolve("/index.html", false)).unwrap();
    let (_, _, body, _) = expect_found(block_on(resolver.resolve("/index.html", false)).unwrap());

    assert_eq!(body, b"<html>top</html>");
    assert_eq!(server.hits_for("index.html"), 1);

    // エントリとサイドカーがディスクに存在する
    assert!(dir.path().join("index.html").exists());
    assert!(dir.path().join("index.html.meta").exists());
}

#[test]
fn test_expired_entry_refetched() {
    let server = MockS3Server::start(&[("index.html", "v1", "text/html")]);
    let dir = tempdir().unwrap();
    // TTL 0 = 即座に期限切れ
    let resolver = make_resolver(&server, dir.path(), 0);

    block_on(resolver.resolve("/index.html", false)).unwrap();
    block_on(resolver.resolve("/index.html", false)).unwrap();

    assert_eq!(server.hits_for("index.html"), 2);
}

#[test]
fn test_force_refresh_refetches_valid_entry() {
    let server = MockS3Server::start(&[("index.html", "v1", "text/html")]);
    let dir = tempdir().unwrap();
    let resolver = make_resolver(&server, dir.path(), 3600);

    block_on(resolver.resolve("/index.html", false)).unwrap();
    block_on(resolver.resolve("/index.html", true)).unwrap();

    assert_eq!(server.hits_for("index.html"), 2);
}

#[test]
fn test_directory_index_fallback() {
    let server = MockS3Server::start(&[("docs/index.html", "<html>docs</html>", "text/html")]);
    let dir = tempdir().unwrap();
    let resolver = make_resolver(&server, dir.path(), 60);

    let (strategy, key, body, _) =
        expect_found(block_on(resolver.resolve("/docs", false)).unwrap());

    assert_eq!(strategy, Strategy::DirectoryIndex);
    assert_eq!(key, "docs/index.html");
    assert_eq!(body, b"<html>docs</html>");

    // 直接ヒットのミスを経てディレクトリインデックスへ
    assert_eq!(server.hits_for("docs"), 1);
    assert_eq!(server.hits_for("docs/index.html"), 1);
}

#[test]
fn test_trailing_slash_directory_index() {
    let server = MockS3Server::start(&[("docs/index.html", "<html>docs</html>", "text/html")]);
    let dir = tempdir().unwrap();
    let resolver = make_resolver(&server, dir.path(), 60);

    let (strategy, key, _, _) =
        expect_found(block_on(resolver.resolve("/docs/", false)).unwrap());

    assert_eq!(strategy, Strategy::DirectoryIndex);
    assert_eq!(key, "docs/index.html");
}

#[test]
fn test_subdirectory_redirect_fallback() {
    let server = MockS3Server::start(&[("app/index.html", "<html>app</html>", "text/html")]);
    let dir = tempdir().unwrap();
    let resolver = make_resolver(&server, dir.path(), 60);

    // app/deep/page も app/deep/page/index.html も存在しない
    let (strategy, key, body, _) =
        expect_found(block_on(resolver.resolve("/app/deep/page", false)).unwrap());

    assert_eq!(strategy, Strategy::SubdirectoryRedirect);
    assert_eq!(key, "app/index.html");
    assert_eq!(body, b"<html>app</html>");
}

#[test]
fn test_root_fallback() {
    let server = MockS3Server::start(&[("index.html", "<html>top</html>", "text/html")]);
    let dir = tempdir().unwrap();
    let resolver = make_resolver(&server, dir.path(), 60);

    let (strategy, key, _, _) =
        expect_found(block_on(resolver.resolve("/nonexistent/path", false)).unwrap());

    assert_eq!(strategy, Strategy::RootFallback);
    assert_eq!(key, "index.html");
}

#[test]
fn test_all_strategies_exhausted() {
    let server = MockS3Server::start(&[]);
    let dir = tempdir().unwrap();
    let resolver = make_resolver(&server, dir.path(), 60);

    match block_on(resolver.resolve("/missing/page", false)).unwrap() {
        Resolution::NotFound => {}
        other => panic!("expected NotFound, got {:?}", other),
    }

    // ミスはキャッシュされない（ネガティブキャッシュなし）
    assert!(resolver.cache().entries().unwrap().is_empty());
}

#[test]
fn test_upstream_failure_propagates() {
    let server = MockS3Server::start(&[("index.html", "top", "text/html")]);
    server.set_fail(true);
    let dir = tempdir().unwrap();
    let resolver = make_resolver(&server, dir.path(), 60);

    match block_on(resolver.resolve("/index.html", false)) {
        Err(StoreError::Failure(_)) => {}
        other => panic!("expected Failure, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_content_type_preserved_on_cache_hit() {
    // 拡張子からの推測では octet-stream になるキーで、
    // 上流が申告した Content-Type がヒット時も保たれることを確認
    let server = MockS3Server::start(&[("data.bin", "payload", "text/plain")]);
    let dir = tempdir().unwrap();
    let resolver = make_resolver(&server, dir.path(), 3600);

    let (_, _, _, miss_type) =
        expect_found(block_on(resolver.resolve("/data.bin", false)).unwrap());
    let (_, _, _, hit_type) =
        expect_found(block_on(resolver.resolve("/data.bin", false)).unwrap());

    assert_eq!(miss_type, "text/plain");
    assert_eq!(hit_type, "text/plain");
    assert_eq!(server.hits_for("data.bin"), 1);
}

#[test]
fn test_slash_folded_cache_layout() {
    let server = MockS3Server::start(&[("assets/css/style.css", "body{}", "text/css")]);
    let dir = tempdir().unwrap();
    let resolver = make_resolver(&server, dir.path(), 3600);

    block_on(resolver.resolve("/assets/css/style.css", false)).unwrap();

    assert!(dir.path().join("assets_css_style.css").exists());
    let entries = resolver.cache().entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].file, "assets_css_style.css");
    assert!(entries[0].valid);
}

#[test]
fn test_cache_clear_forces_refetch() {
    let server = MockS3Server::start(&[("index.html", "top", "text/html")]);
    let dir = tempdir().unwrap();
    let resolver = make_resolver(&server, dir.path(), 3600);

    block_on(resolver.resolve("/index.html", false)).unwrap();
    // エントリ + サイドカー
    assert_eq!(resolver.cache().clear().unwrap(), 2);

    block_on(resolver.resolve("/index.html", false)).unwrap();
    assert_eq!(server.hits_for("index.html"), 2);
}
