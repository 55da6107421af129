//! # S3静的サイトキャッシュプロキシ
//!
//! S3バケット（または互換オブジェクトストレージ）をオリジンとして、
//! 静的サイトのアセットをローカルディスクキャッシュ経由で配信する
//! リバースプロキシのコアライブラリです。
//!
//! ## 特徴
//!
//! - **ディスクキャッシュ**: mtimeベースの固定TTL（デフォルト60秒）による
//!   キャッシュ有効性判定。エントリはフラットなディレクトリに保存
//! - **多段フォールバック解決**: 直接ヒット → ディレクトリインデックス →
//!   サブディレクトリリダイレクト → ルートフォールバック の順で
//!   ストレージキーを解決
//! - **強制リフレッシュ**: `?refresh=1` でキャッシュ有効性を無視して再取得
//! - **オブジェクトストレージ抽象**: `ObjectStore` トレイトにより
//!   テスト時はモックストアへ差し替え可能
//!
//! ## アーキテクチャ
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │  HTTPフロントエンド (main.rs)              │
//! │  └─ Resolver (戦略チェーン)                │← 解決順序の制御
//! │      └─ CacheStore (ディスク + TTL)        │← キャッシュ有効性
//! │          └─ ObjectStore (S3Client)         │← オリジン取得
//! └────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod config;
pub mod resolve;
pub mod store;
