use uuid::Uuid;

/// 单次入站请求的关联 ID，只用于日志串联。
pub fn request_id() -> String {
    format!("req-{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_prefixed_and_unique() {
        let a = request_id();
        let b = request_id();
        assert!(a.starts_with("req-"));
        assert_eq!(a.len(), "req-".len() + 32);
        assert_ne!(a, b);
    }
}
