//! `snapkv` is a multi-tenant, versioned, read-mostly embedded key-value
//! store. It hosts many logical databases under one data directory, where
//! each database is a sequence of immutable on-disk snapshots published by
//! one-shot bulk writes. Readers always see the latest published version;
//! older versions stay readable until a background pass reclaims them.
//! Publication is coordinated across processes through a memory-mapped
//! version record guarded by byte-range advisory locks, so several
//! processes can serve and refresh the same data directory. [Author fengyang]
//!
//! ## Getting started
//!
//! ```rust
//! use snapkv::codec::int_codec::IntCodec;
//! use snapkv::codec::string_codec::StringCodec;
//! use snapkv::config::StoreOptions;
//! use snapkv::engine::sled_engine::SledEngine;
//! use snapkv::error::CResult;
//! use snapkv::store::Store;
//!
//! fn main() {
//!     run().unwrap();
//! }
//!
//! fn run() -> CResult<()> {
//!     let dir = tempfile::tempdir()?;
//!     let opts = StoreOptions {
//!         data_dir: dir.path().join("data"),
//!         ..StoreOptions::default()
//!     };
//!     let store = Store::open(opts, SledEngine::new(), IntCodec::new(), StringCodec::new())?;
//!
//!     // Publish version 1 of the "ranks" database.
//!     let rows = vec![(1, "a".to_string()), (2, "b".to_string())];
//!     store.create_and_fill("ranks", |sink| {
//!         for (key, value) in &rows {
//!             sink.put(key, value)?;
//!         }
//!         Ok(true)
//!     })?;
//!
//!     // Read against the latest published version.
//!     let db = store.get_db("ranks").expect("database should load");
//!     assert_eq!(db.version(), 1);
//!     assert_eq!(db.get(&1), Some("a".to_string()));
//!     assert_eq!(db.multi_get(&[1, 2, 3]), vec![
//!         Some("a".to_string()),
//!         Some("b".to_string()),
//!         None,
//!     ]);
//!
//!     store.close();
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod store;
pub mod version;
