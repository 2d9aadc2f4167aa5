use anyhow::Result;

/// One result row, columns in select order.
pub type Row = Vec<String>;

/// Minimal contract with the columnar store. `?` placeholders bind `args` in order.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn query(&self, sql: &str, args: &[&str]) -> Result<Vec<Row>>;
    async fn exec(&self, sql: &str, args: &[&str]) -> Result<()>;
}
