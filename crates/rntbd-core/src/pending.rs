//! 在途请求表：带代际计数的槽位分配器。
//!
//! 关联 ID 由 `generation << 32 | index` 组成。槽位释放时代际加一，迟到的响应携带旧代际，
//! 查表时自然失配，不会误命中复用同一槽位的新请求。

use crate::record::CorrelationId;

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Free { generation: u32, next: Option<u32> },
}

/// 可增长的代际槽位表。
pub(crate) struct PendingTable<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> PendingTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// 分配槽位；`make` 以新关联 ID 构造值与一个随行产物。槽位下标耗尽时返回 `None`。
    pub(crate) fn insert_with<R>(
        &mut self,
        make: impl FnOnce(CorrelationId) -> (T, R),
    ) -> Option<(CorrelationId, R)> {
        let (index, generation) = match self.free_head {
            Some(index) => {
                let generation = match &self.slots[index as usize] {
                    Slot::Free { generation, next } => {
                        self.free_head = *next;
                        *generation
                    }
                    Slot::Occupied { .. } => unreachable!("free list points at occupied slot"),
                };
                (index, generation)
            }
            None => {
                let index = u32::try_from(self.slots.len()).ok()?;
                self.slots.push(Slot::Free {
                    generation: 0,
                    next: None,
                });
                (index, 0)
            }
        };
        let id = compose(index, generation);
        let (value, extra) = make(id);
        self.slots[index as usize] = Slot::Occupied { generation, value };
        self.len += 1;
        Some((id, extra))
    }

    pub(crate) fn get(&self, id: CorrelationId) -> Option<&T> {
        let (index, generation) = split(id);
        match self.slots.get(index as usize)? {
            Slot::Occupied {
                generation: current,
                value,
            } if *current == generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, id: CorrelationId) -> Option<&mut T> {
        let (index, generation) = split(id);
        match self.slots.get_mut(index as usize)? {
            Slot::Occupied {
                generation: current,
                value,
            } if *current == generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn remove(&mut self, id: CorrelationId) -> Option<T> {
        let (index, generation) = split(id);
        match self.slots.get(index as usize)? {
            Slot::Occupied {
                generation: current,
                ..
            } if *current == generation => {}
            _ => return None,
        }
        let freed = std::mem::replace(
            &mut self.slots[index as usize],
            Slot::Free {
                generation: generation.wrapping_add(1),
                next: self.free_head,
            },
        );
        self.free_head = Some(index);
        self.len -= 1;
        match freed {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Free { .. } => None,
        }
    }

    /// 满足条件的关联 ID 列表（按槽位顺序）。
    pub(crate) fn ids_where(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<CorrelationId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } if pred(value) => {
                    Some(compose(index as u32, *generation))
                }
                _ => None,
            })
            .collect()
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Free { .. } => None,
        })
    }

    /// 取出全部值并保留各槽位的代际。
    pub(crate) fn drain(&mut self) -> Vec<T> {
        let ids = self.ids_where(|_| true);
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}

fn compose(index: u32, generation: u32) -> CorrelationId {
    CorrelationId::from_raw((u64::from(generation) << 32) | u64::from(index))
}

fn split(id: CorrelationId) -> (u32, u32) {
    let raw = id.as_u64();
    (raw as u32, (raw >> 32) as u32)
}
