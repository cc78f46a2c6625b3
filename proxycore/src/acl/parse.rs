use super::{Action, Policy};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
	#[error("unknown action token {0:?}")]
	Unknown(String),
	#[error("bare allow/deny is not permitted under the modern acl policy")]
	BareTokenUnderModern,
	#[error("multiple @action= options on one rule")]
	Duplicate,
}

/// Decodes an `@action=` token into `{allow_flag, add_flag}` per the table
/// in spec §4.2. `policy` gates whether the bare `allow`/`deny` spellings
/// are accepted.
pub fn parse_action(token: &str, policy: Policy) -> Result<Action, ActionError> {
	match token {
		"allow" | "deny" if policy == Policy::Modern => Err(ActionError::BareTokenUnderModern),
		"allow" => Ok(Action { allow_flag: true, add_flag: true }),
		"deny" => Ok(Action { allow_flag: false, add_flag: true }),
		"add_allow" => Ok(Action { allow_flag: true, add_flag: true }),
		"add_deny" => Ok(Action { allow_flag: false, add_flag: true }),
		"set_allow" => Ok(Action { allow_flag: true, add_flag: false }),
		"set_deny" => Ok(Action { allow_flag: false, add_flag: false }),
		other => Err(ActionError::Unknown(other.to_string())),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn legacy_accepts_bare_tokens() {
		assert_eq!(parse_action("allow", Policy::Legacy).unwrap(), Action { allow_flag: true, add_flag: true });
		assert_eq!(parse_action("deny", Policy::Legacy).unwrap(), Action { allow_flag: false, add_flag: true });
	}

	#[test]
	fn modern_rejects_bare_tokens() {
		assert_eq!(parse_action("allow", Policy::Modern).unwrap_err(), ActionError::BareTokenUnderModern);
	}

	#[test]
	fn set_tokens_clear_add_flag() {
		assert_eq!(
			parse_action("set_allow", Policy::Modern).unwrap(),
			Action { allow_flag: true, add_flag: false }
		);
	}
}
