use axum::{http::StatusCode, response::IntoResponse};

// Undocumented banner for load balancers and humans poking at the root.
pub async fn root() -> impl IntoResponse {
    (
        StatusCode::OK,
        format!(
            "{} {}\n",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
    )
}
