use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tapwire_intercept::{
    EngineConfig, HandlerResult, InterceptedRequest, RouteCallback, RouteMatcher,
};
use tapwire_protocol::StaticResponse;

/// Route script replayed by the `tapwire` binary.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
}

impl ScriptConfig {
    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| format!("{}: {err}", path.display()))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        toml::from_str(raw).map_err(|err| err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Pass,
    Continue,
    Reply,
    Destroy,
    SetHeader,
    ExpectHeader,
    ExpectStatus,
    Fail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteSpec {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub regex: bool,
    #[serde(default)]
    pub times: Option<u32>,
    pub action: ActionKind,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl RouteSpec {
    pub fn matcher(&self) -> Result<RouteMatcher, String> {
        let mut matcher = if self.regex {
            RouteMatcher::regex(&self.url).map_err(|err| err.to_string())?
        } else {
            RouteMatcher::url(&self.url)
        };
        if let Some(method) = &self.method {
            matcher = matcher.method(method);
        }
        if let Some(times) = self.times {
            matcher = matcher.times(times);
        }
        Ok(matcher)
    }

    pub fn callback(&self) -> Result<RouteCallback, String> {
        let callback: RouteCallback = match self.action {
            ActionKind::Pass => route(|_req| Ok(())),
            ActionKind::Continue => route(|req| {
                req.continue_request();
                Ok(())
            }),
            ActionKind::Reply => {
                let mut response = StaticResponse::new(self.require(self.status, "status")?);
                response.headers = self.headers.clone();
                response.body = self.body.clone();
                route(move |req| {
                    req.reply(response.clone());
                    Ok(())
                })
            }
            ActionKind::Destroy => route(|req| {
                req.destroy();
                Ok(())
            }),
            ActionKind::SetHeader => {
                let name = self.require(self.header.clone(), "header")?;
                let value = self.require(self.value.clone(), "value")?;
                route(move |req| {
                    req.set_header(&name, &value);
                    Ok(())
                })
            }
            ActionKind::ExpectHeader => {
                let name = self.require(self.header.clone(), "header")?;
                let value = self.require(self.value.clone(), "value")?;
                route(move |req| {
                    let actual = req.header(&name);
                    anyhow::ensure!(
                        actual == Some(value.as_str()),
                        "expected header '{name}' to equal '{value}', got {actual:?}"
                    );
                    req.continue_request();
                    Ok(())
                })
            }
            ActionKind::ExpectStatus => {
                let expected = self.require(self.status, "status")?;
                route(move |req| {
                    req.continue_with(move |res| {
                        let actual = res.status_code();
                        anyhow::ensure!(
                            actual == Some(expected),
                            "expected status {expected}, got {actual:?}"
                        );
                        Ok(())
                    });
                    Ok(())
                })
            }
            ActionKind::Fail => {
                let message = self
                    .message
                    .clone()
                    .unwrap_or_else(|| "route failed".to_string());
                route(move |_req| Err(anyhow::anyhow!("{message}")))
            }
        };
        Ok(callback)
    }

    fn require<T>(&self, field: Option<T>, name: &str) -> Result<T, String> {
        field.ok_or_else(|| format!("route '{}': {:?} needs `{name}`", self.url, self.action))
    }
}

fn route<F>(callback: F) -> RouteCallback
where
    F: Fn(&mut InterceptedRequest) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(callback)
}
