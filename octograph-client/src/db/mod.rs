pub mod latest_point_queries;

pub use latest_point_queries::{LatestPointQuery, QuestDbLatestPointQuery};
