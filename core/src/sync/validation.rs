use crate::{error::Result, types::Block};
use async_trait::async_trait;
use mockall::automock;
use std::collections::HashSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
	/// The block extends the main chain.
	MainBranch,
	/// The block belongs to a branch diverging from the main chain.
	Fork,
	Rejected,
}

/// Full validation of the downloaded blocks.
pub trait BlockValidator: Send + Sync {
	fn verdict(&self, block: &Block, head: Option<&Block>) -> Verdict;
}

/// Validator checking the chain linking only.
#[derive(Clone, Copy, Default)]
pub struct ChainLinkValidator;

impl BlockValidator for ChainLinkValidator {
	fn verdict(&self, block: &Block, head: Option<&Block>) -> Verdict {
		match head {
			None if block.number == 0 && block.previous_hash.is_none() => Verdict::MainBranch,
			None => Verdict::Rejected,
			Some(head) if block.extends(head) => Verdict::MainBranch,
			Some(_) if block.previous_hash.is_some() => Verdict::Fork,
			Some(_) => Verdict::Rejected,
		}
	}
}

#[automock]
#[async_trait]
pub trait MembershipOracle: Send + Sync {
	async fn is_member(&self, pubkey: &str) -> Result<bool>;
}

/// Fixed set of member pubkeys.
#[derive(Clone, Debug, Default)]
pub struct StaticMembership {
	members: HashSet<String>,
}

impl StaticMembership {
	pub fn new(members: impl IntoIterator<Item = String>) -> Self {
		StaticMembership {
			members: members.into_iter().collect(),
		}
	}
}

#[async_trait]
impl MembershipOracle for StaticMembership {
	async fn is_member(&self, pubkey: &str) -> Result<bool> {
		Ok(self.members.contains(pubkey))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ledger::tests::chain_block;

	#[test]
	fn chain_link_verdicts() {
		let validator = ChainLinkValidator;
		let head = chain_block(4, "H4", Some("H3"));

		let next = chain_block(5, "H5", Some("H4"));
		assert_eq!(validator.verdict(&next, Some(&head)), Verdict::MainBranch);

		let sibling = chain_block(4, "F4", Some("H3"));
		assert_eq!(validator.verdict(&sibling, Some(&head)), Verdict::Fork);

		let root = chain_block(0, "H0", None);
		assert_eq!(validator.verdict(&root, None), Verdict::MainBranch);
		assert_eq!(validator.verdict(&next, None), Verdict::Rejected);
		assert_eq!(validator.verdict(&root, Some(&head)), Verdict::Rejected);
	}

	#[tokio::test]
	async fn static_membership() {
		let membership = StaticMembership::new(["A".to_string()]);
		assert!(membership.is_member("A").await.unwrap());
		assert!(!membership.is_member("B").await.unwrap());
	}
}
