//! A `ProblemGateway` that treats the problem id itself as the site's
//! problem code.
//!
//! There is no externally hosted "problem service" in this deployment --
//! problems are identified by their site problem code directly (e.g.
//! `1325A`), so existence is only ever checked downstream, by the site
//! itself rejecting an unknown code. A real deployment with its own problem
//! catalog would replace this with a gateway backed by that catalog.

use async_trait::async_trait;
use flux_kernel::Result;
use flux_nyx::ProblemGateway;

pub struct IdentityProblemGateway;

#[async_trait]
impl ProblemGateway for IdentityProblemGateway {
    async fn site_problem_code(&self, problem_id: &str) -> Result<String> {
        Ok(problem_id.to_string())
    }
}
