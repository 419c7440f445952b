use crate::storage::Fingerprint;

/// 源对象与目标对象的关系
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectRelation {
    /// 目标不存在
    Missing,
    /// 指纹不同
    Changed,
    /// 指纹相同
    Unchanged,
}

impl ObjectRelation {
    /// 是否需要复制
    pub fn needs_copy(self) -> bool {
        !matches!(self, ObjectRelation::Unchanged)
    }
}

/// 比较源指纹和目标指纹（目标可能不存在）
///
/// 指纹是不透明的令牌，只做精确相等比较，不做大小写或格式上的规范化。
pub fn compare(source: &Fingerprint, dest: Option<&Fingerprint>) -> ObjectRelation {
    match dest {
        None => ObjectRelation::Missing,
        Some(d) if d == source => ObjectRelation::Unchanged,
        Some(_) => ObjectRelation::Changed,
    }
}

/// 目标对象是否过期
pub fn is_stale(source: &Fingerprint, dest: Option<&Fingerprint>) -> bool {
    compare(source, dest).needs_copy()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_is_stale() {
        let src = Fingerprint::new("0x8DB");
        assert_eq!(compare(&src, None), ObjectRelation::Missing);
        assert!(is_stale(&src, None));
    }

    #[test]
    fn test_equal_is_not_stale() {
        let src = Fingerprint::new("0x8DB");
        let dst = Fingerprint::new("0x8DB");
        assert_eq!(compare(&src, Some(&dst)), ObjectRelation::Unchanged);
        assert!(!is_stale(&src, Some(&dst)));
    }

    #[test]
    fn test_comparison_is_exact() {
        let src = Fingerprint::new("0x8DBA");
        // 不做大小写规范化
        assert!(is_stale(&src, Some(&Fingerprint::new("0x8dba"))));
        assert_eq!(
            compare(&src, Some(&Fingerprint::new("0x8DBB"))),
            ObjectRelation::Changed
        );
    }
}
