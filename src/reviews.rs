//! Item reviews: listing and one-review-per-author submission.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::auth::{AuthContext, AuthError};
use crate::clock::Clock;
use crate::model::Review;
use crate::remote::RemoteError;

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

/// Remote review storage.
#[async_trait]
pub trait RemoteReviewSource: Send + Sync {
  /// Reviews of one item, newest first.
  async fn reviews_for_item(&self, item_id: &str) -> Result<Vec<Review>, RemoteError>;

  async fn insert_review(&self, review: &Review) -> Result<(), RemoteError>;

  /// Replace title, body and rating of the review with the same id.
  async fn update_review(&self, review: &Review) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReviewError {
  #[error("Rating must be between 1 and 5, got {0}")]
  InvalidRating(u8),
  #[error("A review needs a title or a body")]
  Empty,
  #[error(transparent)]
  Auth(#[from] AuthError),
  #[error(transparent)]
  Remote(#[from] RemoteError),
}

/// What the user typed into the review form.
#[derive(Debug, Clone, Default)]
pub struct ReviewDraft {
  pub author_name: String,
  pub title: String,
  pub body: String,
  pub rating: u8,
}

pub struct ReviewService {
  remote: Arc<dyn RemoteReviewSource>,
  auth: Arc<dyn AuthContext>,
  clock: Arc<dyn Clock>,
}

impl ReviewService {
  pub fn new(
    remote: Arc<dyn RemoteReviewSource>,
    auth: Arc<dyn AuthContext>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self { remote, auth, clock }
  }

  pub async fn reviews(&self, item_id: &str) -> Result<Vec<Review>, ReviewError> {
    Ok(self.remote.reviews_for_item(item_id).await?)
  }

  /// Mean rating of the given reviews, or None when there are none.
  pub fn average_rating(reviews: &[Review]) -> Option<f64> {
    if reviews.is_empty() {
      return None;
    }
    let sum: u32 = reviews.iter().map(|r| u32::from(r.rating)).sum();
    Some(f64::from(sum) / reviews.len() as f64)
  }

  /// Publish the signed-in user's review of an item.
  ///
  /// An author has at most one review per item: if one exists it is updated
  /// in place, keeping its id and creation time.
  pub async fn submit(&self, item_id: &str, draft: ReviewDraft) -> Result<Review, ReviewError> {
    if !(MIN_RATING..=MAX_RATING).contains(&draft.rating) {
      return Err(ReviewError::InvalidRating(draft.rating));
    }
    let title = draft.title.trim().to_string();
    let body = draft.body.trim().to_string();
    if title.is_empty() && body.is_empty() {
      return Err(ReviewError::Empty);
    }
    let user_id = self.auth.current_user_id()?;

    let existing = self
      .remote
      .reviews_for_item(item_id)
      .await?
      .into_iter()
      .find(|r| r.author_id.as_deref() == Some(user_id.as_str()));

    match existing {
      Some(mut review) => {
        review.author_name = draft.author_name;
        review.title = title;
        review.body = body;
        review.rating = draft.rating;
        self.remote.update_review(&review).await?;
        tracing::info!(target: "scentshelf::reviews", item_id, review_id = %review.id, "Updated review");
        Ok(review)
      }
      None => {
        let created_at = self.clock.now();
        let review = Review {
          id: review_id(&user_id, item_id, created_at.timestamp_micros()),
          item_id: item_id.to_string(),
          author_id: Some(user_id),
          author_name: draft.author_name,
          title,
          body,
          rating: draft.rating,
          created_at,
        };
        self.remote.insert_review(&review).await?;
        tracing::info!(target: "scentshelf::reviews", item_id, review_id = %review.id, "Published review");
        Ok(review)
      }
    }
  }
}

/// Stable id for a new review, derived from author, item and creation time.
fn review_id(user_id: &str, item_id: &str, micros: i64) -> String {
  let mut hasher = Sha256::new();
  hasher.update(user_id.as_bytes());
  hasher.update(b"|");
  hasher.update(item_id.as_bytes());
  hasher.update(b"|");
  hasher.update(micros.to_be_bytes());
  hex::encode(&hasher.finalize()[..16])
}
