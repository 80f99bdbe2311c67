use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde_json::Value;

use crate::suite::{DeploymentContext, TestOutcome, TestResult, TestSuite};

/// Router-info and trip-plan checks against an OpenTripPlanner-style API.
pub struct ExampleSuite {
    client: Client,
    context: DeploymentContext,
    from: (f64, f64),
    to: (f64, f64),
}

impl ExampleSuite {
    pub const IDENTIFIER: &'static str = "ExampleSuite";

    const ROUTER_PATH: &'static str = "otp/routers/default";
    const PLAN_PATH: &'static str = "otp/routers/default/plan";

    pub fn new(context: DeploymentContext) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            context,
            // Two points in central Portland, OR.
            from: (45.5189, -122.6794),
            to: (45.5306, -122.6690),
        })
    }

    pub fn with_places(mut self, from: (f64, f64), to: (f64, f64)) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    fn plan_url(&self) -> String {
        format!(
            "{}?fromPlace={},{}&toPlace={},{}&mode=TRANSIT,WALK",
            self.context.endpoint(Self::PLAN_PATH),
            self.from.0,
            self.from.1,
            self.to.0,
            self.to.1
        )
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("GET {} returned {}", url, status);
        }
        response
            .json()
            .await
            .with_context(|| format!("GET {} returned invalid JSON", url))
    }

    async fn router_info(&self) -> TestResult {
        let url = self.context.endpoint(Self::ROUTER_PATH);
        let info = self.get_json(&url).await?;
        if info.get("routerId").is_none() && info.get("polygon").is_none() {
            bail!("router info from {} has neither routerId nor polygon", url);
        }
        Ok(TestOutcome::Passed)
    }

    async fn plan_trip(&self) -> TestResult {
        let body = self.get_json(&self.plan_url()).await?;
        check_itineraries(&body)
    }
}

/// A plan response passes when it carries at least one itinerary.
fn check_itineraries(body: &Value) -> TestResult {
    if let Some(msg) = body.pointer("/error/msg").and_then(Value::as_str) {
        bail!("planner returned error: {}", msg);
    }
    match body.pointer("/plan/itineraries").and_then(Value::as_array) {
        Some(itineraries) if !itineraries.is_empty() => Ok(TestOutcome::Passed),
        Some(_) => bail!("plan contains no itineraries"),
        None => bail!("response has no plan"),
    }
}

#[async_trait::async_trait]
impl TestSuite for ExampleSuite {
    fn tests(&self) -> Vec<&'static str> {
        vec!["router_info", "plan_trip"]
    }

    async fn run(&self, test: &str) -> TestResult {
        match test {
            "router_info" => self.router_info().await,
            "plan_trip" => self.plan_trip().await,
            other => bail!("unknown test '{}'", other),
        }
    }
}
