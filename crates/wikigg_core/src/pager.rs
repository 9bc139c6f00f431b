use std::marker::PhantomData;
use std::vec;

use anyhow::Result;

/// One response of a paged endpoint: the items it carried and the cursor the
/// server handed back for the next request. `next == None` ends the sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T, C> {
    pub items: Vec<T>,
    pub next: Option<C>,
}

impl<T, C> Page<T, C> {
    pub fn new(items: Vec<T>, next: Option<C>) -> Self {
        Self { items, next }
    }

    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }
}

#[derive(Debug)]
enum CursorState<C> {
    Start,
    At(C),
    Done,
}

/// Lazy batch iterator over a cursor-paged endpoint.
///
/// `fetch` receives the cursor returned by the previous page (`None` on the
/// first call). Every fetched batch is yielded, including the last one. A
/// fetch error is yielded once and the iterator is exhausted afterwards.
pub struct Pager<T, C, F> {
    fetch: F,
    state: CursorState<C>,
    fetched: usize,
    _items: PhantomData<fn() -> T>,
}

pub type BoxedFetch<'a, T, C> = Box<dyn FnMut(Option<&C>) -> Result<Page<T, C>> + 'a>;

pub type BoxedPager<'a, T, C> = Pager<T, C, BoxedFetch<'a, T, C>>;

pub fn paginate<T, C, F>(fetch: F) -> Pager<T, C, F>
where
    F: FnMut(Option<&C>) -> Result<Page<T, C>>,
{
    Pager {
        fetch,
        state: CursorState::Start,
        fetched: 0,
        _items: PhantomData,
    }
}

pub fn paginate_boxed<'a, T, C, F>(fetch: F) -> BoxedPager<'a, T, C>
where
    F: FnMut(Option<&C>) -> Result<Page<T, C>> + 'a,
{
    paginate(Box::new(fetch) as BoxedFetch<'a, T, C>)
}

impl<T, C, F> Pager<T, C, F>
where
    F: FnMut(Option<&C>) -> Result<Page<T, C>>,
{
    /// Number of pages requested so far.
    pub fn pages_fetched(&self) -> usize {
        self.fetched
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, CursorState::Done)
    }

    /// Flatten the batches into single items.
    pub fn items(self) -> Items<Self, T> {
        Items {
            batches: self,
            current: Vec::new().into_iter(),
            failed: false,
        }
    }
}

impl<T, C, F> Iterator for Pager<T, C, F>
where
    F: FnMut(Option<&C>) -> Result<Page<T, C>>,
{
    type Item = Result<Vec<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let cursor = match std::mem::replace(&mut self.state, CursorState::Done) {
            CursorState::Done => return None,
            CursorState::Start => None,
            CursorState::At(cursor) => Some(cursor),
        };

        self.fetched += 1;
        match (self.fetch)(cursor.as_ref()) {
            Ok(page) => {
                if let Some(next) = page.next {
                    self.state = CursorState::At(next);
                }
                Some(Ok(page.items))
            }
            Err(error) => Some(Err(error)),
        }
    }
}

/// Item-level view over a batch iterator.
pub struct Items<I, T> {
    batches: I,
    current: vec::IntoIter<T>,
    failed: bool,
}

impl<I, T> Iterator for Items<I, T>
where
    I: Iterator<Item = Result<Vec<T>>>,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.current.next() {
                return Some(Ok(item));
            }
            if self.failed {
                return None;
            }
            match self.batches.next()? {
                Ok(batch) => self.current = batch.into_iter(),
                Err(error) => {
                    self.failed = true;
                    return Some(Err(error));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use anyhow::bail;

    use super::{Page, paginate};

    #[test]
    fn follows_cursor_until_absent() {
        let mut seen_cursors = Vec::new();
        let pager = paginate(|cursor: Option<&String>| {
            seen_cursors.push(cursor.cloned());
            Ok(match cursor.map(String::as_str) {
                None => Page::new(vec![1, 2], Some("b".to_string())),
                Some("b") => Page::new(vec![3], Some("c".to_string())),
                Some(_) => Page::last(vec![4]),
            })
        });

        let items = pager.items().collect::<anyhow::Result<Vec<_>>>().expect("items");
        assert_eq!(items, vec![1, 2, 3, 4]);
        assert_eq!(
            seen_cursors,
            vec![None, Some("b".to_string()), Some("c".to_string())]
        );
    }

    #[test]
    fn yields_final_page_before_stopping() {
        let mut pager = paginate(|_: Option<&u32>| Ok(Page::last(vec!["only"])));
        assert_eq!(pager.next().expect("first").expect("ok"), vec!["only"]);
        assert!(pager.is_finished());
        assert!(pager.next().is_none());
        assert_eq!(pager.pages_fetched(), 1);
    }

    #[test]
    fn empty_page_with_cursor_keeps_going() {
        let mut responses = VecDeque::from(vec![
            Page::new(Vec::<u8>::new(), Some(1u32)),
            Page::new(Vec::new(), Some(2)),
            Page::last(vec![9]),
        ]);
        let items = paginate(|_: Option<&u32>| {
            Ok(responses.pop_front().expect("unexpected extra request"))
        })
        .items()
        .collect::<anyhow::Result<Vec<_>>>()
        .expect("items");
        assert_eq!(items, vec![9]);
        assert!(responses.is_empty());
    }

    #[test]
    fn error_ends_the_sequence() {
        let mut calls = 0;
        let mut items = paginate(|cursor: Option<&u32>| {
            calls += 1;
            match cursor {
                None => Ok(Page::new(vec![1], Some(1))),
                Some(_) => bail!("remote failure"),
            }
        })
        .items();

        assert_eq!(items.next().expect("first").expect("ok"), 1);
        let error = items.next().expect("error item").expect_err("must fail");
        assert!(error.to_string().contains("remote failure"));
        assert!(items.next().is_none());
        drop(items);
        assert_eq!(calls, 2);
    }

    #[test]
    fn nothing_is_fetched_until_polled() {
        let mut calls = 0;
        {
            let _pager = paginate(|_: Option<&u32>| {
                calls += 1;
                Ok(Page::last(vec![0u8]))
            });
        }
        assert_eq!(calls, 0);
    }
}
