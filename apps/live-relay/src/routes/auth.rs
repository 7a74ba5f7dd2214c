use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};

use super::ApiError;
use crate::auth::SessionUser;
use crate::state::AppState;

/// The signed-in user. Rejects with 401 when no valid token is presented.
#[derive(Clone, Debug)]
pub struct CurrentUser(pub SessionUser);

/// The signed-in user if there is one; game streams admit anonymous viewers.
#[derive(Clone, Debug)]
pub struct MaybeUser(pub Option<SessionUser>);

#[async_trait]
impl FromRequestParts<AppState> for MaybeUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user = extract_token(parts).and_then(|token| state.auth.session_user(&token));
        Ok(MaybeUser(user))
    }
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let MaybeUser(user) = MaybeUser::from_request_parts(parts, state).await?;
        user.map(CurrentUser).ok_or(ApiError::Unauthorized)
    }
}

impl CurrentUser {
    pub fn id(&self) -> &str {
        &self.0.id
    }
}

impl MaybeUser {
    pub fn id(&self) -> Option<&str> {
        self.0.as_ref().map(|user| user.id.as_str())
    }
}

fn extract_token(parts: &Parts) -> Option<String> {
    bearer_token(&parts.headers).or_else(|| query_token(parts.uri.query()?))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token.trim().to_owned())
        .filter(|token| !token.is_empty())
}

// EventSource cannot set headers, so streams pass the token in the query string.
fn query_token(query: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == "access_token")
        .map(|(_, value)| value.into_owned())
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(uri: &str, auth: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri(uri);
        if let Some(auth) = auth {
            builder = builder.header("authorization", auth);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn header_wins_over_query() {
        let parts = parts("/s?access_token=from-query", Some("Bearer from-header"));
        assert_eq!(extract_token(&parts).as_deref(), Some("from-header"));
    }

    #[test]
    fn query_token_is_decoded() {
        let parts = parts("/s?tabId=A1&access_token=a%20b", None);
        assert_eq!(extract_token(&parts).as_deref(), Some("a b"));
    }

    #[test]
    fn missing_or_blank_tokens_yield_none() {
        assert_eq!(extract_token(&parts("/s", None)), None);
        assert_eq!(extract_token(&parts("/s?access_token=", Some("Bearer "))), None);
        assert_eq!(extract_token(&parts("/s", Some("Basic abc"))), None);
    }
}
