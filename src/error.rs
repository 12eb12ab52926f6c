use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

/// Failure of a single call against the task backend.
#[derive(Debug, Error)]
pub enum ApiError {
  /// The request never produced an HTTP response.
  #[error("transport error: {0}")]
  Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

  /// Non-2xx status, or a 2xx body carrying `success: false`.
  #[error("backend rejected request ({status}): {}", message.as_deref().unwrap_or("no message"))]
  Application { status: u16, message: Option<String> },

  /// The body did not match the expected shape.
  #[error("malformed response: {0}")]
  Malformed(String),
}

impl ApiError {
  pub fn transport<E>(err: E) -> Self
  where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
  {
    ApiError::Transport(err.into())
  }

  /// Text suitable for a user-facing notification.
  pub fn user_message(&self) -> String {
    match self {
      ApiError::Transport(e) => format!("Could not reach the task service: {}", e),
      ApiError::Application { message: Some(m), .. } if !m.trim().is_empty() => m.clone(),
      ApiError::Application { status, .. } => {
        format!("The task service could not complete the request (HTTP {})", status)
      }
      ApiError::Malformed(detail) => format!("Unexpected response from the task service: {}", detail),
    }
  }
}

impl From<reqwest::Error> for ApiError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_decode() {
      ApiError::Malformed(err.to_string())
    } else {
      ApiError::Transport(Box::new(err))
    }
  }
}

impl From<serde_json::Error> for ApiError {
  fn from(err: serde_json::Error) -> Self {
    ApiError::Malformed(err.to_string())
  }
}
