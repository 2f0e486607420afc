// Copyright 2026 refetch Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{sync::Arc, time::Duration};

use clap::Args;
use futures_util::{future::BoxFuture, FutureExt};
use refetch::prelude::*;
use serde_json::Value as Json;

use crate::api::Api;

#[derive(Debug, Args)]
pub struct PostsArgs {
    /// Count of pages to walk.
    #[arg(long, default_value_t = 3)]
    pages: u64,

    /// Time in milliseconds fetched data stays fresh.
    #[arg(long, default_value_t = 0)]
    stale_time_ms: u64,

    /// Fetch attempts per query, including the first one.
    #[arg(long, default_value_t = 3)]
    retry: u32,
}

type Fetch = BoxFuture<'static, Result<Json>>;

/// `["posts", page]`
fn posts_fn(api: &Arc<Api>) -> impl Fn(QueryKey) -> Fetch + Send + Sync + 'static {
    let api = api.clone();
    move |key| api.clone().posts(int_segment(&key, 1)).boxed()
}

/// `["comments", post]`
fn comments_fn(api: &Arc<Api>) -> impl Fn(QueryKey) -> Fetch + Send + Sync + 'static {
    let api = api.clone();
    move |key| api.clone().comments(int_segment(&key, 1)).boxed()
}

fn int_segment(key: &QueryKey, index: usize) -> u64 {
    match key.segments().get(index) {
        Some(Segment::Int(n)) => u64::try_from(*n).unwrap_or(0),
        _ => 0,
    }
}

fn print_page(result: &QueryResult<Json>) {
    let Some(data) = result.data.as_ref() else {
        match result.error.as_ref() {
            Some(e) => println!("{}: error after {} attempts: {e}", result.key, result.failure_count),
            None => println!("{}: no data", result.key),
        }
        return;
    };
    let titles = data["posts"]
        .as_array()
        .map(|posts| posts.iter().filter_map(|p| p["title"].as_str()).collect::<Vec<_>>())
        .unwrap_or_default();
    println!(
        "{}: status {:?}, previous data {}, {} posts: {}",
        result.key,
        result.status,
        result.is_previous_data,
        titles.len(),
        titles.join(", ")
    );
}

fn has_more(result: &QueryResult<Json>) -> bool {
    result.data.as_ref().and_then(|data| data["has_more"].as_bool()).unwrap_or(false)
}

fn first_post(result: &QueryResult<Json>) -> Option<u64> {
    result.data.as_ref()?["posts"][0]["id"].as_u64()
}

pub async fn run(api: Arc<Api>, args: PostsArgs) -> anyhow::Result<()> {
    let options = QueryOptions::default()
        .with_stale_time(Duration::from_millis(args.stale_time_ms))
        .with_retry(args.retry)
        .with_retry_delay(Duration::from_millis(100), Duration::from_secs(2));
    let client = QueryClient::<Json>::builder()
        .with_name("posts")
        .with_default_options(options.clone())
        .build()?;

    let mut posts = client.observe_with(
        query_key!["posts", 1],
        posts_fn(&api),
        options.clone().with_keep_previous_data(true),
    )?;
    let r = posts.result();
    println!("{}: loading {}, fetching {}", r.key, r.is_loading(), r.is_fetching());
    let mut result = posts.wait_for(|r| !r.is_fetching()).await;
    print_page(&result);

    for page in 2..=args.pages {
        if !has_more(&result) {
            break;
        }
        client.prefetch(query_key!["posts", page], posts_fn(&api)).await;
        tracing::info!("[posts]: prefetched page {page}");

        posts.set_key(query_key!["posts", page]);
        let r = posts.result();
        println!(
            "{}: loading {}, fetching {}, previous data {}",
            r.key,
            r.is_loading(),
            r.is_fetching(),
            r.is_previous_data
        );
        result = posts.wait_for(|r| !r.is_fetching()).await;
        print_page(&result);
    }

    let Some(id) = first_post(&result) else {
        println!("no post to play with");
        return Ok(());
    };

    let comments = client.fetch_query(query_key!["comments", id], comments_fn(&api), options.clone()).await;
    match comments {
        Ok(comments) => println!("{} comments on post #{id}", comments.as_array().map_or(0, Vec::len)),
        Err(e) => println!("comments on post #{id}: {e}"),
    }

    let update = client
        .mutation_with(
            {
                let api = api.clone();
                move |(id, title): (u64, String)| api.clone().update_post(id, title)
            },
            MutationOptions::default()
                .with_retry(args.retry)
                .with_invalidates(query_key!["posts"]),
        )?
        .with_on_success(|post: &Json| tracing::info!("[posts]: updated post {}", post["id"]));
    let delete = client
        .mutation_with(
            {
                let api = api.clone();
                move |id: u64| api.clone().delete_post(id)
            },
            MutationOptions::default().with_invalidates(query_key!["posts"]),
        )?
        .with_on_error(|e: &Error| tracing::warn!("[posts]: delete failed: {e}"));

    match update.mutate((id, format!("post #{id} (edited)"))).await {
        Ok(_) => print_page(&posts.wait_for(|r| !r.is_fetching()).await),
        Err(e) => println!("update post #{id}: {e}"),
    }
    match delete.mutate(id).await {
        Ok(_) => print_page(&posts.wait_for(|r| !r.is_fetching()).await),
        Err(e) => println!("delete post #{id}: {e}, state {:?}", delete.state().status),
    }

    let started = client.on_focus();
    println!("window focus refetched {started} stale queries");
    print_page(&posts.wait_for(|r| !r.is_fetching()).await);

    let keys = client.queries().keys(&KeyFilter::All);
    println!(
        "cached: {}",
        keys.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ")
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_segment() {
        assert_eq!(int_segment(&query_key!["posts", 3], 1), 3);
        assert_eq!(int_segment(&query_key!["posts", -3], 1), 0);
        assert_eq!(int_segment(&query_key!["posts"], 1), 0);
        assert_eq!(int_segment(&query_key!["posts", "3"], 1), 0);
        assert_eq!(int_segment(&query_key!["posts", u64::MAX], 1), u64::MAX);
    }
}
