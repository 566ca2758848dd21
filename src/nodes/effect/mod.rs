mod chain;
mod group;
mod mixer;

pub(crate) use chain::EffectChain;
pub(crate) use group::GroupNode;
pub(crate) use mixer::mix_inputs;
