// Driver package / 驱动包
pub mod local;
pub mod memory;
pub mod s3;

use url::Url;

use crate::environment::Environment;
use crate::storage::{Error, RegistryBuilder, UrlOpenerRegistry};

/// Register all drivers / 注册所有驱动
pub fn register_all(builder: &mut RegistryBuilder) {
    // In-memory driver / 注册内存驱动
    builder.register_factory(Box::new(memory::MemoryDriverFactory));
    // Local filesystem driver / 注册本地驱动
    builder.register_factory(Box::new(local::LocalDriverFactory));
    // S3 driver / 注册S3对象存储驱动
    builder.register_factory(Box::new(s3::S3DriverFactory));
    tracing::info!("Registered built-in drivers");
}

/// Registry with every built-in driver, reading credentials from `env`
/// 包含全部内置驱动的注册表
pub fn default_registry(env: Environment) -> UrlOpenerRegistry {
    let mut builder = UrlOpenerRegistry::builder();
    builder.environment(env);
    register_all(&mut builder);
    builder.build()
}

/// Value of query parameter `name`; the registry has already rejected duplicates.
pub(crate) fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// Parse a boolean URL parameter / 解析布尔参数
pub(crate) fn parse_bool(name: &str, value: &str) -> anyhow::Result<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(Error::invalid_argument(format!(
            "{} must be true or false, not {:?}",
            name, other
        ))
        .into()),
    }
}

/// Behaviour every driver has to share, run against `mem` and `file`.
#[cfg(test)]
mod conformance {
    use super::*;
    use crate::context::Context;
    use crate::storage::{Bucket, ErrorKind, ListOptions, WriterOptions};

    async fn open(url: &str) -> Bucket {
        default_registry(Environment::empty())
            .open_bucket(&Context::background(), url)
            .await
            .unwrap()
    }

    async fn check_hello_scenario(bucket: &Bucket) {
        let ctx = Context::background();
        bucket.write_all(&ctx, "a/b.txt", b"hello", WriterOptions::default()).await.unwrap();
        assert_eq!(bucket.read_all(&ctx, "a/b.txt").await.unwrap(), b"hello");

        let opts = ListOptions {
            prefix: "a/".to_string(),
            ..Default::default()
        };
        let listed = bucket.list(opts).collect_all(&ctx).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "a/b.txt");
        assert_eq!(listed[0].size, 5);

        bucket.delete(&ctx, "a/b.txt").await.unwrap();
        let err = bucket.read_all(&ctx, "a/b.txt").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    async fn check_round_trip(bucket: &Bucket) {
        let ctx = Context::background();
        let big: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let cases: Vec<(&str, Vec<u8>)> = vec![
            ("empty", Vec::new()),
            ("unicode/文件.bin", vec![0, 1, 2, 255]),
            ("deep/x/y/z.dat", big),
        ];
        for (key, data) in &cases {
            let opts = WriterOptions {
                buffer_size: Some(4096),
                ..Default::default()
            };
            bucket.write_all(&ctx, key, data, opts).await.unwrap();
            assert_eq!(&bucket.read_all(&ctx, key).await.unwrap(), data, "key {}", key);
        }

        let mut reader = bucket.new_range_reader(&ctx, "deep/x/y/z.dat", 1000, 10).await.unwrap();
        let mut part = Vec::new();
        reader.read_to_end(&mut part).await.unwrap();
        reader.close().await.unwrap();
        assert_eq!(part, cases[2].1[1000..1010].to_vec());
    }

    async fn check_missing_keys(bucket: &Bucket) {
        let ctx = Context::background();
        for key in ["never-written", "dir/never-written"] {
            let err = bucket.read_all(&ctx, key).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotFound);
            assert!(!bucket.exists(&ctx, key).await.unwrap());
        }
        let err = bucket.delete(&ctx, "never-written").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    async fn check_listing_pages(bucket: &Bucket) {
        let ctx = Context::background();
        let keys = ["p/a", "p/b/1", "p/b/2", "p/c", "p/d/x/y", "pz", "q/a"];
        for key in keys {
            bucket.write_all(&ctx, key, key.as_bytes(), WriterOptions::default()).await.unwrap();
        }

        let flat = ListOptions {
            prefix: "p/".to_string(),
            ..Default::default()
        };
        let expected = vec!["p/a", "p/b/1", "p/b/2", "p/c", "p/d/x/y"];
        for page_size in [1, 2, 3, 1000] {
            let got: Vec<String> = bucket
                .list_with_page_size(flat.clone(), page_size)
                .collect_all(&ctx)
                .await
                .unwrap()
                .into_iter()
                .map(|o| o.key)
                .collect();
            assert_eq!(got, expected, "page size {}", page_size);
        }

        let nested = ListOptions {
            prefix: "p/".to_string(),
            delimiter: "/".to_string(),
        };
        for page_size in [1, 2, 1000] {
            let got: Vec<(String, bool)> = bucket
                .list_with_page_size(nested.clone(), page_size)
                .collect_all(&ctx)
                .await
                .unwrap()
                .into_iter()
                .map(|o| (o.key, o.is_dir))
                .collect();
            assert_eq!(
                got,
                vec![
                    ("p/a".to_string(), false),
                    ("p/b/".to_string(), true),
                    ("p/c".to_string(), false),
                    ("p/d/".to_string(), true),
                ],
                "page size {}",
                page_size
            );
        }
    }

    async fn check_cancelled_write(bucket: &Bucket) {
        let ctx = Context::background();
        bucket.write_all(&ctx, "doc", b"original", WriterOptions::default()).await.unwrap();

        let write_ctx = ctx.child();
        let mut writer = bucket.new_writer(&write_ctx, "doc", WriterOptions::default()).await.unwrap();
        writer.write(b"replacement that never lands").await.unwrap();
        write_ctx.cancel();
        let err = writer.close().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);
        assert_eq!(bucket.read_all(&ctx, "doc").await.unwrap(), b"original");

        let write_ctx = ctx.child();
        let mut writer = bucket.new_writer(&write_ctx, "fresh", WriterOptions::default()).await.unwrap();
        writer.write(b"partial").await.unwrap();
        write_ctx.cancel();
        assert!(writer.close().await.is_err());
        assert!(!bucket.exists(&ctx, "fresh").await.unwrap());
    }

    async fn check_if_not_exist(bucket: &Bucket) {
        let ctx = Context::background();
        let opts = WriterOptions {
            if_not_exist: true,
            ..Default::default()
        };
        bucket.write_all(&ctx, "once", b"first", opts.clone()).await.unwrap();
        let err = bucket.write_all(&ctx, "once", b"second", opts).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(bucket.read_all(&ctx, "once").await.unwrap(), b"first");
    }

    async fn check_copy_and_attributes(bucket: &Bucket) {
        let ctx = Context::background();
        let mut opts = WriterOptions {
            content_type: Some("text/csv".to_string()),
            cache_control: Some("no-cache".to_string()),
            ..Default::default()
        };
        opts.metadata.insert("Owner".to_string(), "ops".to_string());
        bucket.write_all(&ctx, "src.csv", b"a,b\n1,2\n", opts).await.unwrap();
        bucket.copy(&ctx, "dst.csv", "src.csv").await.unwrap();

        let attrs = bucket.attributes(&ctx, "dst.csv").await.unwrap();
        assert_eq!(attrs.size, 8);
        assert_eq!(attrs.content_type, "text/csv");
        assert_eq!(attrs.cache_control.as_deref(), Some("no-cache"));
        assert_eq!(attrs.metadata.get("owner").map(String::as_str), Some("ops"));
        assert_eq!(attrs.md5, Some(md5::compute(b"a,b\n1,2\n").0));

        let err = bucket.copy(&ctx, "x", "missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    async fn check_concurrent_access(bucket: &Bucket) {
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let bucket = bucket.clone();
                tokio::spawn(async move {
                    let ctx = Context::background();
                    let key = format!("conc/{:02}", i);
                    let data = key.repeat(100);
                    bucket.write_all(&ctx, &key, data.as_bytes(), WriterOptions::default()).await.unwrap();
                    assert_eq!(bucket.read_all(&ctx, &key).await.unwrap(), data.as_bytes());
                    // Other tasks write while this listing runs; it only has to see its own key.
                    let opts = ListOptions {
                        prefix: "conc/".to_string(),
                        ..Default::default()
                    };
                    let listed = bucket.list_with_page_size(opts, 3).collect_all(&ctx).await.unwrap();
                    assert!(listed.iter().any(|o| o.key == key));
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let ctx = Context::background();
        let opts = ListOptions {
            prefix: "conc/".to_string(),
            ..Default::default()
        };
        let keys: Vec<String> = bucket
            .list(opts)
            .collect_all(&ctx)
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        let expected: Vec<String> = (0..16).map(|i| format!("conc/{:02}", i)).collect();
        assert_eq!(keys, expected);
    }

    async fn check_close(bucket: Bucket) {
        let ctx = Context::background();
        bucket.write_all(&ctx, "k", b"v", WriterOptions::default()).await.unwrap();

        let mut reader = bucket.new_reader(&ctx, "k").await.unwrap();
        let err = bucket.close().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
        reader.close().await.unwrap();
        assert_eq!(reader.close().await.unwrap_err().kind(), ErrorKind::Closed);

        bucket.close().await.unwrap();
        assert_eq!(bucket.close().await.unwrap_err().kind(), ErrorKind::Closed);
        let err = bucket.read_all(&ctx, "k").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
    }

    async fn run_all(url: &str) {
        check_hello_scenario(&open(url).await).await;
        check_round_trip(&open(url).await).await;
        check_missing_keys(&open(url).await).await;
        check_if_not_exist(&open(url).await).await;
        check_copy_and_attributes(&open(url).await).await;
        check_cancelled_write(&open(url).await).await;
        check_concurrent_access(&open(url).await).await;
        check_close(open(url).await).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_memory_driver() {
        run_all("mem://").await;
        check_listing_pages(&open("mem://").await).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_local_driver() {
        let tmp = tempfile::tempdir().unwrap();
        let url = Url::from_directory_path(tmp.path()).unwrap();
        run_all(url.as_str()).await;

        let listing = tmp.path().join("listing");
        let mut url = Url::from_directory_path(&listing).unwrap();
        url.set_query(Some("create_dir=true"));
        check_listing_pages(&open(url.as_str()).await).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_prefixed_bucket() {
        run_all("mem://?prefix=tenant/").await;
        let tmp = tempfile::tempdir().unwrap();
        let mut url = Url::from_directory_path(tmp.path()).unwrap();
        url.set_query(Some("prefix=nested/"));
        check_listing_pages(&open(url.as_str()).await).await;
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("x", "1").unwrap());
        assert!(!parse_bool("x", "false").unwrap());
        let err = parse_bool("x", "yes").unwrap_err();
        assert_eq!(crate::storage::error::classify(&err), ErrorKind::InvalidArgument);
    }
}
