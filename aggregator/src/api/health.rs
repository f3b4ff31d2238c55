/// Liveness probe; the gateway has no required downstream at startup.
pub async fn health() -> &'static str {
    "OK"
}
