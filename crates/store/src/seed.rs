//! Deterministic sample data for benchmarks and tests.

use crate::backend::Session;
use crate::error::Result;
use crate::value::{Row, Value};
use tracing::instrument;

const OWNERS: [&str; 4] = ["alice", "bob", "carol", "dave"];
const LOREM: &str = "Lorem ipsum dolor sit amet, consectetur adipiscing elit, sed do eiusmod tempor incididunt. ";

/// Inserts `blogs` blogs with `posts_per_blog` posts each.
///
/// The same loader always produces the same rows (given an empty store), so
/// benchmark runs are comparable with each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeedLoader {
    pub blogs: u64,
    pub posts_per_blog: u64,
}

/// Rows inserted by one [`SeedLoader::seed`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub blogs: u64,
    pub posts: u64,
}

impl Default for SeedLoader {
    fn default() -> Self {
        Self { blogs: 100, posts_per_blog: 10 }
    }
}

impl SeedLoader {
    pub fn new(blogs: u64, posts_per_blog: u64) -> Self {
        Self { blogs, posts_per_blog }
    }

    /// Values of the `n`th blog (1-based).
    pub fn blog(n: u64) -> Row {
        let index = usize::try_from(n).unwrap_or_default();
        Row::from([
            ("name".to_string(), Value::from(format!("Blog {n}"))),
            ("url".to_string(), Value::from(format!("https://blog{n}.example.com"))),
            ("description".to_string(), (n % 2 == 0).then(|| format!("Notes from blog number {n}")).into()),
            ("rating".to_string(), Value::Integer((n % 5) as i64 + 1)),
            ("owner".to_string(), Value::from(OWNERS[index % OWNERS.len()])),
        ])
    }

    /// Values of the `n`th post (1-based) of the blog with identifier
    /// `blog_id`.
    pub fn post(blog_id: i64, n: u64) -> Row {
        let paragraphs = usize::try_from(n % 4 + 2).unwrap_or(2);
        Row::from([
            ("blog_id".to_string(), Value::Integer(blog_id)),
            ("title".to_string(), Value::from(format!("Post {n} of blog {blog_id}"))),
            ("content".to_string(), Value::from(LOREM.repeat(paragraphs))),
            ("published".to_string(), Value::Bool(n % 3 != 0)),
            ("views".to_string(), Value::Integer((blog_id * 31 + n as i64 * 17) % 1000)),
        ])
    }

    #[instrument("seeding store", skip(self, session), fields(blogs = self.blogs, posts_per_blog = self.posts_per_blog))]
    pub async fn seed(&self, session: &mut dyn Session) -> Result<SeedSummary> {
        let mut summary = SeedSummary::default();
        for n in 1..=self.blogs {
            let blog_id = session.insert("blog", &Self::blog(n)).await?;
            summary.blogs += 1;
            for p in 1..=self.posts_per_blog {
                session.insert("post", &Self::post(blog_id, p)).await?;
                summary.posts += 1;
            }
        }
        tracing::info!(blogs = summary.blogs, posts = summary.posts, "Seeded store");
        Ok(summary)
    }
}
