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
use refetch::prelude::*;
use serde_json::Value as Json;

use crate::api::Api;

#[derive(Debug, Args)]
pub struct InfiniteArgs {
    /// Stop after this many pages even if more are available.
    #[arg(long, default_value_t = 10)]
    max_pages: usize,

    /// Refetch every loaded page after the listing is exhausted.
    #[arg(long)]
    refetch: bool,
}

fn next_cursor(page: &Json) -> Option<PageParam> {
    page.get("next").filter(|next| next.is_string()).cloned()
}

fn people(pages: &Pages<Json>) -> usize {
    pages
        .iter()
        .map(|page| page["results"].as_array().map_or(0, Vec::len))
        .sum()
}

pub async fn run(api: Arc<Api>, args: InfiniteArgs) -> anyhow::Result<()> {
    let client = QueryClient::<Json>::builder().with_name("people").build()?;
    let options = InfiniteQueryOptions::new(next_cursor)
        .with_initial_param(Api::first_people_cursor())
        .with_query_options(
            QueryOptions::default().with_retry_delay(Duration::from_millis(100), Duration::from_secs(2)),
        );

    let mut observer = client.observe_infinite(
        "sw-people",
        {
            let api = api.clone();
            move |_: QueryKey, cursor: PageParam| {
                let cursor = cursor.as_str().unwrap_or(Api::first_people_cursor()).to_string();
                api.clone().people(cursor)
            }
        },
        options,
    )?;

    let result = observer.wait_for(|r| !r.is_fetching()).await;
    if let Some(e) = result.error {
        anyhow::bail!("first page of people: {e}");
    }

    let mut failures = 0;
    while observer.has_next_page() {
        let loaded = observer.result().data.map_or(0, |pages| pages.len());
        if loaded >= args.max_pages {
            println!("stop at {loaded} pages");
            break;
        }
        match observer.fetch_next_page().await {
            Ok(Some(pages)) => println!(
                "page {}: {} people loaded, next {}",
                pages.len(),
                people(&pages),
                pages.next_param().map_or("none".to_string(), ToString::to_string)
            ),
            Ok(None) => break,
            Err(e) if failures < 3 => {
                failures += 1;
                println!("fetch next page: {e}, retry");
            }
            Err(e) => anyhow::bail!("fetch next page: {e}"),
        }
    }

    if args.refetch {
        let before = observer.result().updated_at;
        client.invalidate(QueryKey::from("sw-people"));
        let result = observer.wait_for(|r| !r.is_fetching()).await;
        match result.data {
            Some(pages) if result.updated_at != before => {
                println!("refetched {} pages, {} people", pages.len(), people(&pages))
            }
            _ => println!("refetch failed: {:?}", result.error.map(|e| e.to_string())),
        }
    }

    println!("has next page: {}", observer.has_next_page());
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_next_cursor() {
        let url = "https://swapi.dev/api/people/?page=2";
        assert_eq!(next_cursor(&json!({ "next": url })), Some(json!(url)));
        assert_eq!(next_cursor(&json!({ "next": null })), None);
        assert_eq!(next_cursor(&json!({})), None);
    }
}
