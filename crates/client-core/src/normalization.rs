use crate::{
    error::AppError,
    types::{AppEvent, MembershipAck, MembershipField, Notice, NoticeLevel},
};

/// Toggle result before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// Remote write accepted.
    Applied { member: bool },
    /// Remote write (or a local precondition) failed; `member` is the local
    /// flag after the failure policy ran.
    Failed { member: bool, error: AppError },
}

/// Convert a toggle outcome to a stable `AppEvent::MembershipAck`.
pub fn normalize_toggle_outcome(
    field: MembershipField,
    element: impl Into<String>,
    outcome: ToggleOutcome,
) -> AppEvent {
    let element = element.into();
    match outcome {
        ToggleOutcome::Applied { member } => AppEvent::MembershipAck(MembershipAck {
            field,
            element,
            member,
            error_code: None,
        }),
        ToggleOutcome::Failed { member, error } => AppEvent::MembershipAck(MembershipAck {
            field,
            element,
            member,
            error_code: Some(error.code),
        }),
    }
}

/// Convert an error into a dismissable error notice.
pub fn error_notice(error: AppError) -> AppEvent {
    AppEvent::Notice(Notice {
        level: NoticeLevel::Error,
        retryable: error.category.is_transient(),
        code: error.code,
        message: error.message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_applied_toggle_to_ack() {
        let event = normalize_toggle_outcome(
            MembershipField::Favorites,
            "https://x/img.jpg",
            ToggleOutcome::Applied { member: true },
        );

        match event {
            AppEvent::MembershipAck(ack) => {
                assert_eq!(ack.field, MembershipField::Favorites);
                assert_eq!(ack.element, "https://x/img.jpg");
                assert!(ack.member);
                assert_eq!(ack.error_code, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn maps_failed_toggle_to_ack_with_stable_error_code() {
        let event = normalize_toggle_outcome(
            MembershipField::Participants,
            "u1",
            ToggleOutcome::Failed {
                member: false,
                error: AppError::remote_unavailable("offline"),
            },
        );

        match event {
            AppEvent::MembershipAck(ack) => {
                assert!(!ack.member);
                assert_eq!(ack.error_code.as_deref(), Some("remote_unavailable"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn error_notice_marks_transient_failures_retryable() {
        let AppEvent::Notice(notice) = error_notice(AppError::fetch_failed("load_users", 5, None))
        else {
            panic!("expected notice");
        };
        assert_eq!(notice.level, NoticeLevel::Error);
        assert_eq!(notice.code, "fetch_failed");
        assert!(notice.retryable);

        let AppEvent::Notice(notice) = error_notice(AppError::unauthenticated("toggle")) else {
            panic!("expected notice");
        };
        assert!(!notice.retryable);
    }
}
