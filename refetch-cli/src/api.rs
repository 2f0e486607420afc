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

//! An in-process JSON API with latency and random failures.

use std::{sync::Arc, time::Duration};

use clap::Args;
use parking_lot::Mutex;
use rand::Rng;
use refetch::{Error, Result};
use serde_json::{json, Value as Json};

const PEOPLE_URL: &str = "https://swapi.dev/api/people/";

#[derive(Debug, Clone, Args)]
pub struct ApiArgs {
    /// Mean latency of an api call in milliseconds. The actual latency is jittered by up to 50%.
    #[arg(long, default_value_t = 200)]
    latency_ms: u64,

    /// Probability of an api call to fail with a `503`.
    #[arg(long, default_value_t = 0.1)]
    failure_rate: f64,

    /// Count of posts on the server.
    #[arg(long, default_value_t = 35)]
    posts: u64,

    /// Count of people on the server.
    #[arg(long, default_value_t = 42)]
    people: u64,

    /// Page size of the posts and people listings.
    #[arg(long, default_value_t = 10)]
    page_size: u64,
}

#[derive(Debug)]
pub struct Api {
    latency: Duration,
    failure_rate: f64,
    page_size: usize,
    posts: Mutex<Vec<Json>>,
    people: u64,
}

impl Api {
    pub fn new(args: &ApiArgs) -> Arc<Self> {
        let posts = (1..=args.posts)
            .map(|id| json!({ "id": id, "title": format!("post #{id}"), "body": format!("body of post #{id}") }))
            .collect();
        Arc::new(Self {
            latency: Duration::from_millis(args.latency_ms),
            failure_rate: args.failure_rate.clamp(0.0, 1.0),
            page_size: args.page_size.max(1) as usize,
            posts: Mutex::new(posts),
            people: args.people,
        })
    }

    /// Sleep for a jittered latency, then fail at the configured rate.
    async fn roundtrip(&self, route: &str) -> Result<()> {
        let (latency, fail) = {
            let mut rng = rand::rng();
            let jitter = rng.random_range(0.5..1.5);
            (self.latency.mul_f64(jitter), rng.random_bool(self.failure_rate))
        };
        tokio::time::sleep(latency).await;
        if fail {
            tracing::debug!("[api]: {route} failed after {latency:?}");
            return Err(Error::http(503).with_context("route", route));
        }
        tracing::debug!("[api]: {route} served after {latency:?}");
        Ok(())
    }

    /// `GET /posts?page=n`, pages are 1-based.
    pub async fn posts(self: Arc<Self>, page: u64) -> Result<Json> {
        self.roundtrip(&format!("GET /posts?page={page}")).await?;
        if page == 0 {
            return Err(Error::http(400).with_context("page", page));
        }
        let posts = self.posts.lock();
        let start = (page as usize - 1) * self.page_size;
        let items = posts.iter().skip(start).take(self.page_size).cloned().collect::<Vec<_>>();
        Ok(json!({
            "page": page,
            "posts": items,
            "has_more": start + self.page_size < posts.len(),
        }))
    }

    /// `GET /posts/{id}/comments`.
    pub async fn comments(self: Arc<Self>, post: u64) -> Result<Json> {
        self.roundtrip(&format!("GET /posts/{post}/comments")).await?;
        if !self.posts.lock().iter().any(|p| p["id"] == post) {
            return Err(Error::http(404).with_context("post", post));
        }
        let comments = (1..=post % 4 + 1)
            .map(|n| json!({ "id": post * 100 + n, "post": post, "body": format!("comment {n} on post #{post}") }))
            .collect::<Vec<_>>();
        Ok(Json::Array(comments))
    }

    /// `DELETE /posts/{id}`.
    pub async fn delete_post(self: Arc<Self>, id: u64) -> Result<Json> {
        self.roundtrip(&format!("DELETE /posts/{id}")).await?;
        let mut posts = self.posts.lock();
        let len = posts.len();
        posts.retain(|p| p["id"] != id);
        if posts.len() == len {
            return Err(Error::http(404).with_context("post", id));
        }
        Ok(json!({ "id": id }))
    }

    /// `PATCH /posts/{id}`.
    pub async fn update_post(self: Arc<Self>, id: u64, title: String) -> Result<Json> {
        self.roundtrip(&format!("PATCH /posts/{id}")).await?;
        let mut posts = self.posts.lock();
        let post = posts
            .iter_mut()
            .find(|p| p["id"] == id)
            .ok_or_else(|| Error::http(404).with_context("post", id))?;
        post["title"] = Json::String(title);
        Ok(post.clone())
    }

    /// `GET` of a people cursor. The first cursor is [`Api::first_people_cursor`], the response carries the next one
    /// in `next`, `null` on the last page.
    pub async fn people(self: Arc<Self>, cursor: String) -> Result<Json> {
        self.roundtrip(&format!("GET {cursor}")).await?;
        let page = match cursor.split_once("?page=") {
            None => 1,
            Some((_, page)) => page.parse::<u64>().map_err(Error::parse)?,
        };
        if page == 0 {
            return Err(Error::http(400).with_context("page", page));
        }
        let size = self.page_size as u64;
        let first = (page - 1) * size + 1;
        let last = (page * size).min(self.people);
        let results = (first..=last)
            .map(|id| json!({ "id": id, "name": format!("person #{id}") }))
            .collect::<Vec<_>>();
        let next = if last < self.people {
            Json::String(format!("{PEOPLE_URL}?page={}", page + 1))
        } else {
            Json::Null
        };
        Ok(json!({ "count": self.people, "results": results, "next": next }))
    }

    pub fn first_people_cursor() -> &'static str {
        PEOPLE_URL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(failure_rate: f64) -> Arc<Api> {
        Api::new(&ApiArgs {
            latency_ms: 10,
            failure_rate,
            posts: 25,
            people: 12,
            page_size: 10,
        })
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_posts_pages() {
        let api = api(0.0);

        let page = api.clone().posts(3).await.unwrap();
        assert_eq!(page["posts"].as_array().unwrap().len(), 5);
        assert_eq!(page["has_more"], false);

        let page = api.clone().posts(1).await.unwrap();
        assert_eq!(page["posts"][0]["id"], 1);
        assert_eq!(page["has_more"], true);

        let err = api.posts(0).await.unwrap_err();
        assert_eq!(err.http_status(), Some(400));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_mutate_posts() {
        let api = api(0.0);

        api.clone().update_post(2, "renamed".to_string()).await.unwrap();
        api.clone().delete_post(1).await.unwrap();
        let page = api.clone().posts(1).await.unwrap();
        assert_eq!(page["posts"][0]["title"], "renamed");

        let err = api.clone().delete_post(1).await.unwrap_err();
        assert_eq!(err.http_status(), Some(404));
        let err = api.comments(1).await.unwrap_err();
        assert_eq!(err.http_status(), Some(404));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_people_cursors() {
        let api = api(0.0);

        let page = api.clone().people(Api::first_people_cursor().to_string()).await.unwrap();
        assert_eq!(page["results"].as_array().unwrap().len(), 10);
        let next = page["next"].as_str().unwrap().to_string();
        let page = api.people(next).await.unwrap();
        assert_eq!(page["results"].as_array().unwrap().len(), 2);
        assert!(page["next"].is_null());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_always_failing() {
        let api = api(1.0);
        let err = api.posts(1).await.unwrap_err();
        assert_eq!(err.http_status(), Some(503));
        assert!(err.is_retryable());
    }
}
