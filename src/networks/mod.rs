pub mod blocks;
pub mod transform;
pub mod vgg;
pub mod weights;

use tch::nn;

/// Where a block registers its parameters and how its graph nodes are named.
///
/// Parameter paths and node names follow the same dotted hierarchy, so the
/// node `res1.conv2.norm` normalises with `res1.conv2.norm.gamma`.
#[derive(Debug)]
pub struct Scope<'a> {
    path: nn::Path<'a>,
    name: String,
}

impl<'a> Scope<'a> {
    pub fn root(vs: &nn::Path<'a>) -> Scope<'a> {
        Scope {
            path: vs.clone(),
            name: String::new(),
        }
    }

    pub fn sub(&self, name: &str) -> Scope<'a> {
        Scope {
            path: &self.path / name,
            name: self.node(name),
        }
    }

    pub fn path(&self) -> &nn::Path<'a> {
        &self.path
    }

    /// Full name of a node created directly in this scope.
    pub fn node(&self, name: &str) -> String {
        if self.name.is_empty() {
            name.to_owned()
        } else {
            format!("{}.{}", self.name, name)
        }
    }
}
