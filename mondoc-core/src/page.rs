//! Pagination results and parameters.
//!
//! A [`Page`] carries one slice of a larger result set together with the
//! navigation metadata in [`PageMeta`]. Pages are 1-indexed; page and page
//! size below 1 are rejected before anything is read.

use serde::{Deserialize, Serialize};

use crate::error::{OdmError, OdmResult};

/// A single page of results.
///
/// # Example
///
/// ```ignore
/// let page = User::query()
///     .where_eq("status", "active")
///     .paginate(&db, 1, 10)
///     .await?;
///
/// assert!(page.data.len() <= 10);
/// println!("{} of {}", page.meta.page, page.meta.last_page);
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// The items of this page.
    pub data: Vec<T>,
    pub meta: PageMeta,
}

/// Navigation metadata of a [`Page`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    /// Total number of matching items across all pages.
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
    /// `ceil(total / per_page)`; `0` when nothing matched.
    pub last_page: u64,
    pub has_next: bool,
    pub has_prev: bool,
    /// 1-based position of the first item of this page, if any.
    pub from: Option<u64>,
    /// 1-based position of the last item of this page, if any.
    pub to: Option<u64>,
}

impl<T> Page<T> {
    /// Builds a page from its items and the total match count.
    pub fn new(data: Vec<T>, total: u64, params: PaginationParams) -> Self {
        let last_page = total.div_ceil(params.per_page.max(1));
        let offset = params.offset();
        let len = data.len() as u64;

        let meta = PageMeta {
            total,
            page: params.page,
            per_page: params.per_page,
            last_page,
            has_next: params.page < last_page,
            has_prev: params.page > 1,
            from: (len > 0).then_some(offset.saturating_add(1)),
            to: (len > 0).then_some(offset.saturating_add(len)),
        };

        Self { data, meta }
    }

    /// Converts the items, keeping the metadata.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            data: self.data.into_iter().map(f).collect(),
            meta: self.meta,
        }
    }
}

/// Which page to read and how large pages are.
///
/// ```ignore
/// let params = PaginationParams::new(3, 20);
/// assert_eq!(params.offset(), 40);
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationParams {
    /// The page number (1-indexed).
    pub page: u64,
    /// Number of items per page.
    pub per_page: u64,
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self { page: 1, per_page: 10 }
    }
}

impl PaginationParams {
    pub fn new(page: u64, per_page: u64) -> Self {
        Self { page, per_page }
    }

    /// # Errors
    ///
    /// Returns [`OdmError::Operation`] if `page` or `per_page` is below 1,
    /// or if the page starts beyond the addressable range.
    pub fn validate(&self) -> OdmResult<()> {
        if self.page < 1 || self.per_page < 1 {
            return Err(OdmError::operation(
                "paginate",
                format!(
                    "page and per_page must be at least 1 (got page {}, per_page {})",
                    self.page, self.per_page
                ),
            ));
        }
        if self.checked_offset().is_none() {
            return Err(OdmError::operation(
                "paginate",
                format!("page {} of size {} is out of range", self.page, self.per_page),
            ));
        }
        Ok(())
    }

    /// Number of items before this page, saturating at `u64::MAX`.
    pub fn offset(&self) -> u64 {
        self.checked_offset().unwrap_or(u64::MAX)
    }

    fn checked_offset(&self) -> Option<u64> {
        self.page
            .saturating_sub(1)
            .checked_mul(self.per_page)
            .filter(|offset| usize::try_from(*offset).is_ok())
    }

    /// Slices an in-memory result set into this page.
    pub fn paginate<T>(&self, items: Vec<T>) -> OdmResult<Page<T>> {
        self.validate()?;

        let total = items.len() as u64;
        let data = items
            .into_iter()
            .skip(usize::try_from(self.offset()).unwrap_or(usize::MAX))
            .take(usize::try_from(self.per_page).unwrap_or(usize::MAX))
            .collect();

        Ok(Page::new(data, total, *self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_and_describes_a_page() {
        let items: Vec<i32> = (1..=25).collect();
        let page = PaginationParams::new(3, 10).paginate(items).unwrap();

        assert_eq!(page.data, vec![21, 22, 23, 24, 25]);
        assert_eq!(page.meta.total, 25);
        assert_eq!(page.meta.last_page, 3);
        assert!(!page.meta.has_next);
        assert!(page.meta.has_prev);
        assert_eq!(page.meta.from, Some(21));
        assert_eq!(page.meta.to, Some(25));
    }

    #[test]
    fn empty_results_have_no_pages() {
        let page = PaginationParams::new(1, 10).paginate(Vec::<i32>::new()).unwrap();

        assert_eq!(page.meta.last_page, 0);
        assert!(!page.meta.has_next);
        assert_eq!(page.meta.from, None);
    }

    #[test]
    fn last_page_is_the_ceiling() {
        for (total, per_page, expected) in [(30, 10, 3), (31, 10, 4), (1, 1, 1), (9, 10, 1)] {
            let page = Page::<()>::new(Vec::new(), total, PaginationParams::new(1, per_page));
            assert_eq!(page.meta.last_page, expected);
        }
    }

    #[test]
    fn rejects_zero_page_or_size() {
        assert!(PaginationParams::new(0, 10).validate().is_err());
        assert!(PaginationParams::new(1, 0).paginate(vec![1]).is_err());
    }

    #[test]
    fn rejects_pages_past_the_addressable_range() {
        let params = PaginationParams::new(u64::MAX, 2);

        assert!(params.validate().is_err());
        assert!(params.paginate(vec![1, 2, 3]).is_err());
        assert_eq!(params.offset(), u64::MAX);

        let page = Page::new(vec![1], 1, params);
        assert_eq!(page.meta.to, Some(u64::MAX));
    }

    #[test]
    fn a_single_huge_page_is_still_valid() {
        let page = PaginationParams::new(1, u64::MAX).paginate(vec![1, 2]).unwrap();

        assert_eq!(page.data, vec![1, 2]);
        assert_eq!(page.meta.last_page, 1);
    }
}
