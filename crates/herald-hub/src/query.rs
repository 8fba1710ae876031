use herald_router::Route;
use herald_storage::{Limit, Order};

/// History read across every existing channel selected by `cid`.
///
/// A query without `cid` returns nothing. A query without `limit` uses the
/// hub's configured default (one message unless configured otherwise).
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub cid: Option<Route>,
    pub order: Order,
    pub limit: Option<Limit>,
}

impl Query {
    pub fn new(cid: impl Into<Route>) -> Self {
        Self {
            cid: Some(cid.into()),
            ..Self::default()
        }
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: impl Into<Limit>) -> Self {
        self.limit = Some(limit.into());
        self
    }

    pub fn unbounded(mut self) -> Self {
        self.limit = Some(Limit::Unbounded);
        self
    }
}
