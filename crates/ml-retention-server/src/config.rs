use std::env;

/// Server configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// `None` when neither `DATABASE_URL` nor `DB_HOST` is set
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub cors_origins: Vec<String>,
    pub log_json: bool,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let max_connections = env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|n| n.parse().ok())
            .unwrap_or(10);

        let cors_origins = env::var("CORS_ORIGINS")
            .map(|s| s.split(',').map(|o| o.trim().to_string()).collect())
            .unwrap_or_else(|_| vec!["*".to_string()]);

        let log_json = env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);

        Self {
            port,
            database_url: database_url_from_env(),
            max_connections,
            cors_origins,
            log_json,
        }
    }
}

/// `DATABASE_URL`, or a URL assembled from `DB_*` components (Cloud SQL sockets included)
fn database_url_from_env() -> Option<String> {
    if let Ok(url) = env::var("DATABASE_URL") {
        return Some(url);
    }

    let host = env::var("DB_HOST").ok()?;
    let name = env::var("DB_NAME").unwrap_or_else(|_| "ml_retention".to_string());
    let user = env::var("DB_USER").unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("DB_PASSWORD").unwrap_or_default();
    let port = env::var("DB_PORT").unwrap_or_else(|_| "5432".to_string());

    Some(compose_database_url(&host, &name, &user, &password, &port))
}

fn compose_database_url(host: &str, name: &str, user: &str, password: &str, port: &str) -> String {
    if host.starts_with("/cloudsql/") {
        format!(
            "postgresql://{}:{}@localhost/{}?host={}",
            user, password, name, host
        )
    } else {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            user, password, host, port, name
        )
    }
}
