//! HTTP implementation of the remote sources against a PostgREST-style API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE, RANGE};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

use super::api_types::{
  ApiConcentrationRow, ApiNameRow, ApiPerfume, ApiPerfumeIdRow, ApiReview, ApiReviewWrite,
  ApiStatusRow, ApiUserPerfume, ApiUserPerfumeUpsert,
};
use super::{
  apply_client_filters, normalize_facets, CatalogQuery, RemoteCatalogSource, RemoteError,
  RemoteUserStatusSource,
};
use crate::config::RemoteConfig;
use crate::model::{
  CatalogItem, Facet, PerfumeFilter, RemoteStatus, Review, SortOption, UserStatus,
};
use crate::pattern;
use crate::reviews::RemoteReviewSource;

const ITEM_SELECT: &str = "id,name,concentration,longevity,sillage,performance_score,description,\
image_url,occasions,created_at,brand:brands(name,country),\
perfume_notes(role,position,note:notes(name,category))";

const ITEM_SELECT_BY_BRAND: &str = "id,name,concentration,longevity,sillage,performance_score,\
description,image_url,occasions,created_at,brand:brands!inner(name,country),\
perfume_notes(role,position,note:notes(name,category))";

const COUNT_SELECT: &str = "id";
const COUNT_SELECT_BY_BRAND: &str = "id,brand:brands!inner(name)";

/// Rows per request when a count has to be computed client-side.
const COUNT_CHUNK: usize = 1000;

/// REST client for the catalog, user-status and review tables.
#[derive(Clone)]
pub struct PostgrestClient {
  http: reqwest::Client,
  base: Url,
}

impl PostgrestClient {
  pub fn new(config: &RemoteConfig, api_key: &str) -> Result<Self> {
    let base = Url::parse(&config.url)
      .and_then(|u| u.join("rest/v1/"))
      .map_err(|e| eyre!("Invalid remote url {}: {}", config.url, e))?;

    let mut headers = HeaderMap::new();
    headers.insert(
      "apikey",
      HeaderValue::from_str(api_key).map_err(|e| eyre!("Invalid API key: {}", e))?,
    );
    headers.insert(
      AUTHORIZATION,
      HeaderValue::from_str(&format!("Bearer {}", api_key))
        .map_err(|e| eyre!("Invalid API key: {}", e))?,
    );

    let mut builder = reqwest::Client::builder().default_headers(headers);
    if let Some(secs) = config.timeout_secs {
      builder = builder.timeout(Duration::from_secs(secs));
    }
    let http = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { http, base })
  }

  fn table(&self, name: &str) -> Result<Url, RemoteError> {
    self
      .base
      .join(name)
      .map_err(|e| RemoteError::Unknown(format!("bad table url {}: {}", name, e)))
  }

  /// Send a request and turn non-success statuses into `ServerError`.
  async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
      return Err(RemoteError::from_status(status));
    }
    Ok(response)
  }

  async fn get_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RemoteError> {
    let response = self.send(request).await?;
    Ok(response.json::<T>().await?)
  }

  /// Catalog url carrying every server-side predicate.
  fn catalog_url(
    &self,
    select: &str,
    search: Option<&str>,
    filter: &PerfumeFilter,
  ) -> Result<Url, RemoteError> {
    let mut url = self.table("perfumes")?;
    {
      let mut pairs = url.query_pairs_mut();
      // Filtering on the embedded brand needs an inner join
      let select = match (filter.brand.is_some(), select) {
        (true, ITEM_SELECT) => ITEM_SELECT_BY_BRAND,
        (true, COUNT_SELECT) => COUNT_SELECT_BY_BRAND,
        _ => select,
      };
      pairs.append_pair("select", select);

      if let Some(text) = search.map(str::trim).filter(|s| !s.is_empty()) {
        pairs.append_pair("name", &format!("ilike.{}", pattern::contains_pattern(text)));
      }
      if let Some(brand) = &filter.brand {
        pairs.append_pair("brand.name", &format!("eq.{}", brand));
      }
      if let Some(concentration) = &filter.concentration {
        pairs.append_pair("concentration", &format!("eq.{}", concentration));
      }
      if let Some(longevity) = &filter.longevity {
        pairs.append_pair(
          "longevity",
          &format!("ilike.{}", pattern::contains_pattern(longevity)),
        );
      }
      if let Some(sillage) = &filter.sillage {
        pairs.append_pair(
          "sillage",
          &format!("ilike.{}", pattern::contains_pattern(sillage)),
        );
      }
    }
    Ok(url)
  }

  fn with_range(request: RequestBuilder, from: usize, to: usize) -> RequestBuilder {
    request
      .header("Range-Unit", "items")
      .header(RANGE, format!("{}-{}", from, to))
  }
}

/// `order` value for a sort; `id` breaks ties so ranges do not overlap.
fn order_param(sort: SortOption) -> String {
  let (column, ascending) = sort.order();
  format!(
    "{}.{},id.asc",
    column.column(),
    if ascending { "asc" } else { "desc" }
  )
}

/// Total from a `Content-Range: 0-19/342` (or `*/342`) header.
fn parse_content_range_total(value: &str) -> Option<usize> {
  value.rsplit('/').next()?.trim().parse().ok()
}

#[async_trait]
impl RemoteCatalogSource for PostgrestClient {
  async fn total_count(
    &self,
    search: Option<&str>,
    filter: &PerfumeFilter,
  ) -> Result<usize, RemoteError> {
    if !filter.has_client_side_predicates() {
      let url = self.catalog_url(COUNT_SELECT, search, filter)?;
      let response = self
        .send(self.http.head(url).header("Prefer", "count=exact"))
        .await?;
      let total = response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range_total)
        .ok_or_else(|| RemoteError::Unknown("missing Content-Range total".to_string()))?;
      return Ok(total);
    }

    // Some predicates only exist client-side: walk the server-filtered rows.
    let mut total = 0;
    let mut from = 0;
    loop {
      let mut url = self.catalog_url(ITEM_SELECT, search, filter)?;
      url.query_pairs_mut().append_pair("order", "id.asc");
      let rows: Vec<ApiPerfume> = self
        .get_json(Self::with_range(self.http.get(url), from, from + COUNT_CHUNK - 1))
        .await?;
      let fetched = rows.len();
      let items: Vec<CatalogItem> = rows.into_iter().filter_map(ApiPerfume::into_item).collect();
      total += apply_client_filters(items, filter).len();
      if fetched < COUNT_CHUNK {
        break;
      }
      from += COUNT_CHUNK;
    }
    Ok(total)
  }

  async fn fetch_page(&self, query: &CatalogQuery) -> Result<Vec<CatalogItem>, RemoteError> {
    let mut url = self.catalog_url(ITEM_SELECT, query.search_text(), &query.filter)?;
    url
      .query_pairs_mut()
      .append_pair("order", &order_param(query.sort));

    let (from, to) = query.range();
    let rows: Vec<ApiPerfume> = self
      .get_json(Self::with_range(self.http.get(url), from, to))
      .await?;

    tracing::debug!(target: "scentshelf::remote", page = query.page, rows = rows.len(), "Fetched catalog page");
    let items = rows.into_iter().filter_map(ApiPerfume::into_item).collect();
    Ok(apply_client_filters(items, &query.filter))
  }

  async fn list_facet_values(&self, facet: Facet) -> Result<Vec<String>, RemoteError> {
    match facet {
      Facet::Brand => {
        let mut url = self.table("brands")?;
        url
          .query_pairs_mut()
          .append_pair("select", "name")
          .append_pair("order", "name.asc");
        let rows: Vec<ApiNameRow> = self.get_json(self.http.get(url)).await?;
        Ok(normalize_facets(rows.into_iter().map(|r| r.name)))
      }
      Facet::Concentration => {
        let mut url = self.table("perfumes")?;
        url
          .query_pairs_mut()
          .append_pair("select", "concentration")
          .append_pair("concentration", "not.is.null");
        let rows: Vec<ApiConcentrationRow> = self.get_json(self.http.get(url)).await?;
        Ok(normalize_facets(rows.into_iter().map(|r| r.concentration)))
      }
    }
  }
}

#[async_trait]
impl RemoteUserStatusSource for PostgrestClient {
  async fn upsert(
    &self,
    user_id: &str,
    item_id: &str,
    status: UserStatus,
    created_at: DateTime<Utc>,
  ) -> Result<(), RemoteError> {
    if status.is_none() {
      return Err(RemoteError::Unknown(
        "status 'none' cannot be upserted, delete the record instead".to_string(),
      ));
    }

    let mut url = self.table("user_perfumes")?;
    url
      .query_pairs_mut()
      .append_pair("on_conflict", "user_id,perfume_id");
    let body = ApiUserPerfumeUpsert {
      user_id,
      perfume_id: item_id,
      status: status.as_str(),
      created_at,
    };
    self
      .send(
        self
          .http
          .post(url)
          .header("Prefer", "resolution=merge-duplicates,return=minimal")
          .json(&body),
      )
      .await?;
    Ok(())
  }

  async fn delete(&self, user_id: &str, item_id: &str) -> Result<(), RemoteError> {
    let mut url = self.table("user_perfumes")?;
    url
      .query_pairs_mut()
      .append_pair("user_id", &format!("eq.{}", user_id))
      .append_pair("perfume_id", &format!("eq.{}", item_id));
    self.send(self.http.delete(url)).await?;
    Ok(())
  }

  async fn list_by_status(
    &self,
    user_id: &str,
    status: UserStatus,
  ) -> Result<HashSet<String>, RemoteError> {
    let mut url = self.table("user_perfumes")?;
    url
      .query_pairs_mut()
      .append_pair("select", "perfume_id")
      .append_pair("user_id", &format!("eq.{}", user_id))
      .append_pair("status", &format!("eq.{}", status.as_str()));
    let rows: Vec<ApiPerfumeIdRow> = self.get_json(self.http.get(url)).await?;
    Ok(rows.into_iter().map(|r| r.perfume_id).collect())
  }

  async fn list_all(&self, user_id: &str) -> Result<Vec<RemoteStatus>, RemoteError> {
    let mut url = self.table("user_perfumes")?;
    url
      .query_pairs_mut()
      .append_pair("select", "perfume_id,status,created_at")
      .append_pair("user_id", &format!("eq.{}", user_id));
    let rows: Vec<ApiUserPerfume> = self.get_json(self.http.get(url)).await?;
    Ok(
      rows
        .into_iter()
        .filter_map(ApiUserPerfume::into_remote_status)
        .collect(),
    )
  }

  async fn get_status(
    &self,
    user_id: &str,
    item_id: &str,
  ) -> Result<Option<UserStatus>, RemoteError> {
    let mut url = self.table("user_perfumes")?;
    url
      .query_pairs_mut()
      .append_pair("select", "status")
      .append_pair("user_id", &format!("eq.{}", user_id))
      .append_pair("perfume_id", &format!("eq.{}", item_id));
    let rows: Vec<ApiStatusRow> = self.get_json(self.http.get(url)).await?;
    Ok(
      rows
        .into_iter()
        .find_map(|r| r.status.parse::<UserStatus>().ok())
        .filter(|s| !s.is_none()),
    )
  }
}

#[async_trait]
impl RemoteReviewSource for PostgrestClient {
  async fn reviews_for_item(&self, item_id: &str) -> Result<Vec<Review>, RemoteError> {
    let mut url = self.table("reviews")?;
    url
      .query_pairs_mut()
      .append_pair("select", "*")
      .append_pair("perfume_id", &format!("eq.{}", item_id))
      .append_pair("order", "created_at.desc");
    let rows: Vec<ApiReview> = self.get_json(self.http.get(url)).await?;
    Ok(rows.into_iter().map(ApiReview::into_review).collect())
  }

  async fn insert_review(&self, review: &Review) -> Result<(), RemoteError> {
    let url = self.table("reviews")?;
    self
      .send(
        self
          .http
          .post(url)
          .header("Prefer", "return=minimal")
          .json(&review_body(review)),
      )
      .await?;
    Ok(())
  }

  async fn update_review(&self, review: &Review) -> Result<(), RemoteError> {
    let mut url = self.table("reviews")?;
    url
      .query_pairs_mut()
      .append_pair("id", &format!("eq.{}", review.id));
    self
      .send(
        self
          .http
          .patch(url)
          .header("Prefer", "return=minimal")
          .json(&review_body(review)),
      )
      .await?;
    Ok(())
  }
}

fn review_body(review: &Review) -> ApiReviewWrite<'_> {
  ApiReviewWrite {
    id: &review.id,
    perfume_id: &review.item_id,
    user_id: review.author_id.as_deref(),
    author_name: &review.author_name,
    title: &review.title,
    body: &review.body,
    rating: review.rating,
    created_at: review.created_at,
  }
}
