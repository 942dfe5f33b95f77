//! Shared helpers for integration tests: mock-server clients and archive builders.

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::time::Duration;

use bundlex_core::{ClientConfig, ExchangeClient, UrlGuard};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const TOKEN: &str = "test-token";
pub const PROJECT: &str = "123.abc";

/// Guard that admits the plain-HTTP loopback URLs wiremock hands out.
pub fn loopback_guard() -> UrlGuard {
    UrlGuard::strict().allow_http(true).allow_private_hosts(true)
}

/// Config pointed at `server_uri` with fast backoff and polling.
pub fn config(server_uri: &str) -> ClientConfig {
    ClientConfig::builder(TOKEN, PROJECT)
        .base_url(format!("{server_uri}/api2/"))
        .max_retries(3)
        .backoff(Duration::from_millis(5), Duration::from_millis(20))
        .poll_wait(Duration::from_millis(10), Duration::from_millis(40))
        .url_guard(loopback_guard())
        .build()
        .expect("valid test config")
}

pub fn client(server_uri: &str) -> ExchangeClient {
    ExchangeClient::new(config(server_uri)).expect("client builds")
}

/// API path for a project-scoped endpoint.
pub fn project_path(suffix: &str) -> String {
    format!("/api2/projects/{PROJECT}/{suffix}")
}

/// Builds an in-memory ZIP archive of regular files.
pub fn zip_of(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    for (name, contents) in files {
        writer.start_file(*name, options).expect("start entry");
        writer.write_all(contents).expect("write entry");
    }
    writer.finish().expect("finish archive").into_inner()
}

/// One archive entry for [`zip_with`].
pub enum Entry<'a> {
    File(&'a str, &'a [u8]),
    Dir(&'a str),
    Symlink(&'a str, &'a str),
}

/// Builds an in-memory ZIP archive with mixed entry kinds.
pub fn zip_with(entries: &[Entry<'_>]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    for entry in entries {
        match entry {
            Entry::File(name, contents) => {
                writer.start_file(*name, options).expect("start entry");
                writer.write_all(contents).expect("write entry");
            }
            Entry::Dir(name) => writer.add_directory(*name, options).expect("add directory"),
            Entry::Symlink(name, target) => writer.add_symlink(*name, *target, options).expect("add symlink"),
        }
    }
    writer.finish().expect("finish archive").into_inner()
}
