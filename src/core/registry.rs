use anyhow::{bail, Result};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use super::status::Status;

pub type Args = HashMap<String, String>;

pub struct IoStreams<'a> {
    pub stdout: &'a mut dyn Write,
    pub stderr: &'a mut dyn Write,
}

pub trait Handle: Send + Sync {
    fn verbs(&self) -> &'static [&'static str];
    fn call(&self, verb: &str, args: &Args, io: &mut IoStreams) -> Result<Status>;
}

type Constructor = Arc<dyn Fn(&url::Url) -> Result<Box<dyn Handle>> + Send + Sync>;

/// URL scheme → handle constructor.
#[derive(Default)]
pub struct Registry {
    schemes: HashMap<String, Constructor>,
}

impl Registry {
    pub fn list_schemes(&self) -> Vec<String> {
        let mut v: Vec<String> = self.schemes.keys().cloned().collect();
        v.sort();
        v
    }

    pub fn register_scheme<F>(&mut self, scheme: &str, ctor: F)
    where
        F: Fn(&url::Url) -> Result<Box<dyn Handle>> + 'static + Send + Sync,
    {
        self.schemes.insert(scheme.to_string(), Arc::new(ctor));
    }

    pub fn resolve(&self, target: &str) -> Result<Box<dyn Handle>> {
        let u = url::Url::parse(target)?;
        match self.schemes.get(u.scheme()) {
            Some(ctor) => ctor(&u),
            None => bail!("Unknown scheme: {}", u.scheme()),
        }
    }
}
