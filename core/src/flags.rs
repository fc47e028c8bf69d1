use std::time::Duration;

use env_flags::env_flags;

env_flags! {
    /// Address the HTTP server binds to.
    pub BIND_ADDR: &str = "0.0.0.0:8000";

    /// Connection string for the relational store. A bare path is treated
    /// as a SQLite database file.
    pub DATABASE_URL: &str = "atelier.db";

    pub JWT_SECRET: &str = "dev-secret-change-in-prod";
    pub JWT_EXPIRE_DAYS: i64 = 7;

    /// Comma-separated list of allowed CORS origins.
    pub CORS_ORIGINS: &str = "http://localhost:3000";

    /// `remote` runs code in provider-hosted sandboxes; `local` allocates
    /// per-user workspace directories on this machine and executes through
    /// the local process executor.
    pub SANDBOX_MODE: &str = "remote";
    pub SANDBOX_API_BASE: &str = "https://api.sandbox.example.dev";
    pub SANDBOX_API_KEY: Option<&str> = None;
    pub SANDBOX_TEMPLATE_ID: &str = "react-vite-shadcn-bun";
    pub SANDBOX_TIMEOUT_SECS: u64 = 900;
    /// Domain used to derive public preview hosts: `{port}-{id}.{domain}`.
    pub SANDBOX_DOMAIN: &str = "sbx.example.dev";
    pub SANDBOX_LOCAL_ROOT: &str = "/tmp/atelier-workspaces";
    /// Optional directory synced over the provider image after create.
    pub SANDBOX_TEMPLATE_DIR: Option<&str> = None;

    pub MODEL_NAME: &str = "GLM-4.5-air";
    pub MODEL_BASE_URL: &str = "https://api.z.ai/api/paas/v4";
    pub MODEL_API_KEY: Option<&str> = None;
    pub MODEL_REQUEST_MAX_RETRIES: u64 = 4;
    pub MODEL_STREAM_IDLE_TIMEOUT_MS: Duration = Duration::from_millis(300_000), |value| {
        value.parse().map(Duration::from_millis)
    };

    /// Port the bundled template's dev server listens on.
    pub DEV_SERVER_PORT: u16 = 5173;
}
