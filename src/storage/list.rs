//! Listing: page assembly for drivers and the iterator handed to callers
//! 列表分页与迭代器

use std::collections::VecDeque;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use futures::Stream;

use super::{Bucket, Error, ListObject, ListOptions, ListPage, PageRequest, Result};
use crate::context::Context;

/// Page size used when the caller does not pick one / 默认分页大小
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Page tokens carry the last key of the previous page, so any token stays
/// valid on its own and concurrent listings never share a cursor.
pub fn encode_page_token(last_key: &str) -> String {
    URL_SAFE_NO_PAD.encode(last_key.as_bytes())
}

pub fn decode_page_token(token: &str) -> anyhow::Result<String> {
    let raw = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| Error::invalid_argument(format!("invalid page token {:?}", token)))?;
    let key = String::from_utf8(raw)
        .map_err(|_| Error::invalid_argument(format!("invalid page token {:?}", token)))?;
    Ok(key)
}

/// Build one page from objects sorted ascending by key / 由有序对象构建一页
///
/// Applies the prefix filter, collapses keys on the delimiter into directory
/// entries, skips everything up to the page token and cuts at `page_size`.
pub fn paginate<I>(objects: I, req: &PageRequest) -> anyhow::Result<ListPage>
where
    I: IntoIterator<Item = ListObject>,
{
    let after = match req.page_token.as_deref() {
        Some(token) => Some(decode_page_token(token)?),
        None => None,
    };
    let page_size = req.page_size.max(1);

    let mut page = ListPage::default();
    for obj in objects {
        if !obj.key.starts_with(&req.prefix) {
            continue;
        }
        let entry = collapse(obj, &req.prefix, &req.delimiter);

        // Collapsed directories are contiguous in key order.
        if let Some(last) = page.objects.last() {
            if last.is_dir && last.key == entry.key {
                continue;
            }
        }
        if let Some(after) = &after {
            if entry.key.as_str() <= after.as_str() {
                continue;
            }
        }
        if page.objects.len() == page_size {
            page.next_page_token = page.objects.last().map(|o| encode_page_token(&o.key));
            break;
        }
        page.objects.push(entry);
    }
    Ok(page)
}

fn collapse(obj: ListObject, prefix: &str, delimiter: &str) -> ListObject {
    if delimiter.is_empty() {
        return obj;
    }
    let rest = &obj.key[prefix.len()..];
    match rest.find(delimiter) {
        Some(idx) => ListObject {
            key: format!("{}{}", prefix, &rest[..idx + delimiter.len()]),
            mod_time: None,
            size: 0,
            md5: None,
            is_dir: true,
        },
        None => obj,
    }
}

/// Iterates over every object matching the options, fetching pages lazily.
/// 列表迭代器
pub struct ListIterator {
    bucket: Bucket,
    opts: ListOptions,
    page_size: usize,
    buffered: VecDeque<ListObject>,
    next_token: Option<String>,
    done: bool,
}

impl ListIterator {
    pub(crate) fn new(bucket: Bucket, opts: ListOptions, page_size: usize) -> Self {
        Self {
            bucket,
            opts,
            page_size,
            buffered: VecDeque::new(),
            next_token: None,
            done: false,
        }
    }

    /// Next object, or `None` once the listing is exhausted / 下一个对象
    pub async fn next(&mut self, ctx: &Context) -> Result<Option<ListObject>> {
        loop {
            if let Some(obj) = self.buffered.pop_front() {
                return Ok(Some(obj));
            }
            if self.done {
                return Ok(None);
            }
            let page = match self
                .bucket
                .list_page(ctx, self.next_token.as_deref(), self.page_size, &self.opts)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    self.done = true;
                    return Err(e);
                }
            };
            self.done = page.next_page_token.is_none();
            self.next_token = page.next_page_token;
            self.buffered.extend(page.objects);
        }
    }

    /// Collect the remaining objects / 收集剩余对象
    pub async fn collect_all(mut self, ctx: &Context) -> Result<Vec<ListObject>> {
        let mut out = Vec::new();
        while let Some(obj) = self.next(ctx).await? {
            out.push(obj);
        }
        Ok(out)
    }

    /// Adapt into a `futures::Stream`; the stream ends after the first error.
    pub fn into_stream(self, ctx: Context) -> impl Stream<Item = Result<ListObject>> {
        futures::stream::unfold((self, ctx), |(mut it, ctx)| async move {
            match it.next(&ctx).await {
                Ok(Some(obj)) => Some((Ok(obj), (it, ctx))),
                Ok(None) => None,
                Err(e) => Some((Err(e), (it, ctx))),
            }
        })
    }
}
